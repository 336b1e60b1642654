//! Paths and path patterns
//!
//! Every guard and delta-log operation speaks in dotted paths
//! (`"domain.user.balance"`) with optional bracketed indices
//! (`"domain.items[3]"`). This module defines:
//!
//! - [`PathSegment`]: individual component (key or index)
//! - [`ContextPath`]: parsed path with ancestor/descendant relations
//! - [`PathPattern`] / [`PatternSet`]: contract patterns with trailing `*`
//!   wildcards and sub-path prefixing
//!
//! # Path Syntax
//!
//! | Syntax | Meaning | Example |
//! |--------|---------|---------|
//! | `key` | Mapping key | `domain` |
//! | `[n]` | Sequence index | `[0]` |
//! | `key1.key2` | Nested key | `domain.user` |
//! | `key[n]` | Key then index | `items[3]` |

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of segments in a path
///
/// Limits the depth of paths like `a.b.c.d...` to keep traversal and
/// pattern matching bounded.
pub const MAX_PATH_SEGMENTS: usize = 64;

/// Error type for path parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathParseError {
    /// Paths must be non-empty
    #[error("empty path")]
    Empty,
    /// Empty key in path
    #[error("empty key in path at position {0}")]
    EmptyKey(usize),
    /// Unclosed bracket
    #[error("unclosed bracket starting at position {0}")]
    UnclosedBracket(usize),
    /// Invalid sequence index
    #[error("invalid index at position {0}: {1}")]
    InvalidIndex(usize, String),
    /// Unexpected character
    #[error("unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
    /// Path exceeds [`MAX_PATH_SEGMENTS`]
    #[error("path has {0} segments, maximum is {1}")]
    TooLong(usize, usize),
    /// `*` may only appear as the trailing segment of a pattern
    #[error("wildcard '*' is only allowed as the trailing segment")]
    MisplacedWildcard,
}

/// A segment in a context path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    /// Mapping key: `.foo`
    Key(String),
    /// Sequence index: `[0]`
    Index(usize),
}

impl PathSegment {
    /// Lenient equality used by pattern matching: `items.3` and `items[3]`
    /// refer to the same location.
    pub fn matches(&self, other: &PathSegment) -> bool {
        match (self, other) {
            (PathSegment::Key(a), PathSegment::Key(b)) => a == b,
            (PathSegment::Index(a), PathSegment::Index(b)) => a == b,
            (PathSegment::Key(k), PathSegment::Index(i))
            | (PathSegment::Index(i), PathSegment::Key(k)) => k == &i.to_string(),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "{}", k),
            PathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// A parsed path into the state tree
///
/// Paths are non-empty sequences of segments. Most paths are short, so
/// segments are stored inline (spilling to the heap past four).
///
/// # Examples
///
/// ```
/// use theus_core::path::ContextPath;
///
/// let path: ContextPath = "domain.user.balance".parse().unwrap();
/// assert_eq!(path.len(), 3);
/// assert_eq!(path.top_level(), Some("domain"));
/// assert_eq!(path.leaf_key(), Some("balance"));
///
/// let parent: ContextPath = "domain.user".parse().unwrap();
/// assert!(parent.is_ancestor_of(&path));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ContextPath {
    segments: SmallVec<[PathSegment; 4]>,
}

impl ContextPath {
    /// Create a single-key path
    pub fn key(key: impl Into<String>) -> Self {
        let mut segments = SmallVec::new();
        segments.push(PathSegment::Key(key.into()));
        ContextPath { segments }
    }

    /// Create a path from segments
    pub fn from_segments(segments: impl IntoIterator<Item = PathSegment>) -> Self {
        ContextPath {
            segments: segments.into_iter().collect(),
        }
    }

    /// Get the path segments
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True for the empty (root) path. Parsed paths are never empty; the
    /// empty path only appears as a guard's initial prefix.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append a key segment, returning the extended path
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment::Key(key.into()));
        ContextPath { segments }
    }

    /// Append an index segment, returning the extended path
    pub fn child_index(&self, idx: usize) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment::Index(idx));
        ContextPath { segments }
    }

    /// Concatenate another path onto this one
    pub fn join(&self, other: &ContextPath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        ContextPath { segments }
    }

    /// Parent path (None if this path has a single segment or is empty)
    pub fn parent(&self) -> Option<ContextPath> {
        if self.segments.len() <= 1 {
            return None;
        }
        let mut parent = self.clone();
        parent.segments.pop();
        Some(parent)
    }

    /// Last segment
    pub fn last_segment(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    /// The top-level key (first segment, if it is a key)
    ///
    /// Used by the namespace filter and by smart-CAS conflict detection,
    /// which both operate at top-level-key granularity.
    pub fn top_level(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Key(k)) => Some(k),
            _ => None,
        }
    }

    /// The leaf key used for zone classification
    ///
    /// Walks backwards past trailing indices: `log_events[3]` classifies by
    /// `log_events`.
    pub fn leaf_key(&self) -> Option<&str> {
        self.segments.iter().rev().find_map(|s| match s {
            PathSegment::Key(k) => Some(k.as_str()),
            PathSegment::Index(_) => None,
        })
    }

    /// Check if this path is an ancestor of another (or equal)
    ///
    /// A path is an ancestor if it is a segment-wise prefix of the other.
    /// A path is considered an ancestor of itself.
    pub fn is_ancestor_of(&self, other: &ContextPath) -> bool {
        if self.segments.len() > other.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| a.matches(b))
    }

    /// Check if this path is a descendant of another (or equal)
    pub fn is_descendant_of(&self, other: &ContextPath) -> bool {
        other.is_ancestor_of(self)
    }

    /// Check if this path is a strict ancestor (proper prefix) of another
    pub fn is_strict_ancestor_of(&self, other: &ContextPath) -> bool {
        self.segments.len() < other.segments.len() && self.is_ancestor_of(other)
    }

    /// The suffix of this path relative to an ancestor
    ///
    /// Returns None if `ancestor` is not actually an ancestor.
    pub fn strip_prefix(&self, ancestor: &ContextPath) -> Option<ContextPath> {
        if !ancestor.is_ancestor_of(self) {
            return None;
        }
        Some(ContextPath {
            segments: self.segments[ancestor.len()..].iter().cloned().collect(),
        })
    }
}

impl fmt::Display for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                PathSegment::Key(k) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", k)?;
                }
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}

impl FromStr for ContextPath {
    type Err = PathParseError;

    /// Parse a path from a string
    ///
    /// Supported syntax: `foo`, `foo.bar`, `foo[0]`, `foo[0].bar`.
    /// A leading dot is tolerated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = parse_segments(s)?;
        if segments.is_empty() {
            return Err(PathParseError::Empty);
        }
        Ok(ContextPath { segments })
    }
}

fn parse_segments(s: &str) -> Result<SmallVec<[PathSegment; 4]>, PathParseError> {
    let mut segments: SmallVec<[PathSegment; 4]> = SmallVec::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;

    // Tolerate a leading dot
    if i < chars.len() && chars[i] == '.' {
        i += 1;
    }

    while i < chars.len() {
        if chars[i] == '.' {
            i += 1;
            if i >= chars.len() {
                return Err(PathParseError::EmptyKey(i));
            }
        }

        if chars[i] == '[' {
            let start = i;
            i += 1;
            let idx_start = i;
            while i < chars.len() && chars[i] != ']' {
                i += 1;
            }
            if i >= chars.len() {
                return Err(PathParseError::UnclosedBracket(start));
            }
            let idx_str: String = chars[idx_start..i].iter().collect();
            let idx = idx_str
                .parse::<usize>()
                .map_err(|_| PathParseError::InvalidIndex(idx_start, idx_str.clone()))?;
            segments.push(PathSegment::Index(idx));
            i += 1; // consume ']'
        } else if chars[i] == ']' {
            return Err(PathParseError::UnexpectedChar(']', i));
        } else {
            let key_start = i;
            while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                i += 1;
            }
            let key: String = chars[key_start..i].iter().collect();
            if key.is_empty() {
                return Err(PathParseError::EmptyKey(key_start));
            }
            segments.push(PathSegment::Key(key));
        }
    }

    if segments.len() > MAX_PATH_SEGMENTS {
        return Err(PathParseError::TooLong(segments.len(), MAX_PATH_SEGMENTS));
    }
    Ok(segments)
}

// =============================================================================
// Patterns
// =============================================================================

/// A contract pattern
///
/// Patterns come in three shapes:
///
/// - `"*"` - matches every path
/// - `"domain.user.*"` - matches any path strictly below `domain.user`
/// - `"domain.user"` - matches `domain.user`, everything below it
///   (declaring a parent grants its children), and its ancestors
///   (a coarse write to `domain` is allowed when `domain.user` is declared -
///   the delta log still pins down what actually changed)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    prefix: ContextPath,
    kind: PatternKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternKind {
    /// `*` - match everything
    All,
    /// `prefix.*` - strict descendants of prefix
    Wildcard,
    /// plain path - equal / descendant / ancestor
    Plain,
}

impl PathPattern {
    /// Check whether a path is covered by this pattern
    pub fn matches(&self, path: &ContextPath) -> bool {
        match self.kind {
            PatternKind::All => true,
            PatternKind::Wildcard => {
                self.prefix.is_ancestor_of(path) && path.len() > self.prefix.len()
            }
            PatternKind::Plain => {
                self.prefix.is_ancestor_of(path) || path.is_ancestor_of(&self.prefix)
            }
        }
    }

    /// The original pattern string
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The pattern's fixed prefix path (empty for the match-all pattern)
    pub fn prefix_path(&self) -> &ContextPath {
        &self.prefix
    }

    /// True for the bare `*` pattern
    pub fn is_match_all(&self) -> bool {
        self.kind == PatternKind::All
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for PathPattern {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PathParseError::Empty);
        }
        if s == "*" {
            return Ok(PathPattern {
                raw: s.to_string(),
                prefix: ContextPath::default(),
                kind: PatternKind::All,
            });
        }
        if let Some(rest) = s.strip_suffix(".*") {
            if rest.contains('*') {
                return Err(PathParseError::MisplacedWildcard);
            }
            return Ok(PathPattern {
                raw: s.to_string(),
                prefix: rest.parse()?,
                kind: PatternKind::Wildcard,
            });
        }
        if s.contains('*') {
            return Err(PathParseError::MisplacedWildcard);
        }
        Ok(PathPattern {
            raw: s.to_string(),
            prefix: s.parse()?,
            kind: PatternKind::Plain,
        })
    }
}

/// An unordered set of contract patterns
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatternSet {
    patterns: Vec<PathPattern>,
}

impl PatternSet {
    /// Build a pattern set from pattern strings
    pub fn from_strs<I, S>(patterns: I) -> Result<Self, PathParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PatternSet { patterns })
    }

    /// A set containing only the match-all pattern
    pub fn all() -> Self {
        PatternSet {
            patterns: vec!["*".parse().expect("'*' is a valid pattern")],
        }
    }

    /// True if no patterns are declared
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if any pattern covers the path
    pub fn matches(&self, path: &ContextPath) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }

    /// The declared patterns
    pub fn patterns(&self) -> &[PathPattern] {
        &self.patterns
    }

    /// Pattern strings, for diagnostics
    pub fn as_strings(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.raw.clone()).collect()
    }
}
