//! Path-addressed navigation over value trees
//!
//! Helpers for reading, writing and deleting at a [`ContextPath`] inside a
//! [`Value`] tree or a top-level [`ValueMap`]. Writers create missing
//! intermediate mappings (so a patch built from a delta log contains only
//! the touched subtrees); traversal through an existing non-container is an
//! error, never a silent overwrite.

use crate::error::{Result, TheusError};
use crate::path::{ContextPath, PathSegment};
use crate::value::{Value, ValueMap};

/// Read the value at a path inside a value tree
pub fn get_at_path<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut current = root;
    for seg in segments {
        current = match (seg, current) {
            (PathSegment::Key(k), Value::Map(m)) => m.get(k)?,
            (PathSegment::Index(i), Value::List(l)) => l.get(*i)?,
            (PathSegment::Key(k), Value::List(l)) => l.get(k.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable variant of [`get_at_path`]
pub fn get_at_path_mut<'a>(root: &'a mut Value, segments: &[PathSegment]) -> Option<&'a mut Value> {
    let mut current = root;
    for seg in segments {
        current = match (seg, current) {
            (PathSegment::Key(k), Value::Map(m)) => m.get_mut(k)?,
            (PathSegment::Index(i), Value::List(l)) => l.get_mut(*i)?,
            (PathSegment::Key(k), Value::List(l)) => l.get_mut(k.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a value at a path inside a value tree
///
/// Missing intermediate key segments are created as empty mappings. A Null
/// slot counts as missing. Index segments must resolve into an existing
/// sequence slot.
///
/// # Errors
/// Returns `InvalidInput` when traversal would pass through an existing
/// non-container value or an out-of-range index.
pub fn set_at_path(root: &mut Value, segments: &[PathSegment], value: Value) -> Result<()> {
    if segments.is_empty() {
        *root = value;
        return Ok(());
    }
    let mut current = root;
    for (pos, seg) in segments.iter().enumerate() {
        let last = pos == segments.len() - 1;
        match seg {
            PathSegment::Key(k) => {
                if matches!(current, Value::Null) {
                    *current = Value::map();
                }
                match current {
                    Value::Map(m) => {
                        if last {
                            m.insert(k.clone(), value);
                            return Ok(());
                        }
                        current = m.entry(k.clone()).or_insert_with(Value::map);
                    }
                    Value::List(l) => {
                        let idx: usize = k.parse().map_err(|_| {
                            traversal_error(segments, pos, "non-numeric key into a list")
                        })?;
                        let len = l.len();
                        let slot = l.get_mut(idx).ok_or_else(|| {
                            index_error(segments, pos, idx, len)
                        })?;
                        if last {
                            *slot = value;
                            return Ok(());
                        }
                        current = slot;
                    }
                    other => {
                        let kind = other.type_name();
                        return Err(traversal_error(segments, pos, kind));
                    }
                }
            }
            PathSegment::Index(i) => match current {
                Value::List(l) => {
                    let len = l.len();
                    let slot = l
                        .get_mut(*i)
                        .ok_or_else(|| index_error(segments, pos, *i, len))?;
                    if last {
                        *slot = value;
                        return Ok(());
                    }
                    current = slot;
                }
                other => {
                    let kind = other.type_name();
                    return Err(traversal_error(segments, pos, kind));
                }
            },
        }
    }
    unreachable!("loop returns on the last segment")
}

/// Remove the value at a path inside a value tree
///
/// Returns the removed value, or None if the path did not resolve.
pub fn delete_at_path(root: &mut Value, segments: &[PathSegment]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let parent = get_at_path_mut(root, parents)?;
    match (last, parent) {
        (PathSegment::Key(k), Value::Map(m)) => m.remove(k),
        (PathSegment::Index(i), Value::List(l)) => {
            if *i < l.len() {
                Some(l.remove(*i))
            } else {
                None
            }
        }
        (PathSegment::Key(k), Value::List(l)) => {
            let idx: usize = k.parse().ok()?;
            if idx < l.len() {
                Some(l.remove(idx))
            } else {
                None
            }
        }
        (PathSegment::Key(k), Value::Set(s)) => {
            if s.remove(k) {
                Some(Value::String(k.clone()))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn traversal_error(segments: &[PathSegment], pos: usize, found: &str) -> TheusError {
    TheusError::invalid_input(format!(
        "cannot traverse '{}' at segment {}: found {}",
        ContextPath::from_segments(segments.iter().cloned()),
        pos,
        found
    ))
}

fn index_error(segments: &[PathSegment], pos: usize, idx: usize, len: usize) -> TheusError {
    TheusError::invalid_input(format!(
        "index {} out of range (len {}) in '{}' at segment {}",
        idx,
        len,
        ContextPath::from_segments(segments.iter().cloned()),
        pos
    ))
}

// =============================================================================
// Top-level map variants
// =============================================================================

/// Read at a path rooted in a top-level map
pub fn map_get_at_path<'a>(map: &'a ValueMap, path: &ContextPath) -> Option<&'a Value> {
    let (first, rest) = path.segments().split_first()?;
    let root = match first {
        PathSegment::Key(k) => map.get(k)?,
        PathSegment::Index(_) => return None,
    };
    get_at_path(root, rest)
}

/// Write at a path rooted in a top-level map
///
/// # Errors
/// Returns `InvalidInput` for index-rooted paths or bad traversal.
pub fn map_set_at_path(map: &mut ValueMap, path: &ContextPath, value: Value) -> Result<()> {
    let (first, rest) = path
        .segments()
        .split_first()
        .ok_or_else(|| TheusError::invalid_input("cannot write at the root path"))?;
    let key = match first {
        PathSegment::Key(k) => k,
        PathSegment::Index(_) => {
            return Err(TheusError::invalid_input(
                "top-level segment must be a key, not an index",
            ))
        }
    };
    if rest.is_empty() {
        map.insert(key.clone(), value);
        return Ok(());
    }
    let root = map.entry(key.clone()).or_insert_with(Value::map);
    set_at_path(root, rest, value)
}

/// Remove at a path rooted in a top-level map
pub fn map_delete_at_path(map: &mut ValueMap, path: &ContextPath) -> Option<Value> {
    let (first, rest) = path.segments().split_first()?;
    let key = match first {
        PathSegment::Key(k) => k,
        PathSegment::Index(_) => return None,
    };
    if rest.is_empty() {
        return map.remove(key);
    }
    let root = map.get_mut(key)?;
    delete_at_path(root, rest)
}
