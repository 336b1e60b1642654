//! Heavy-asset handles
//!
//! Heavy values are large, opaque payloads (model weights, raw buffers)
//! that must never be deep-copied by the shadowing machinery. A
//! [`HeavyHandle`] is a refcounted pointer to the payload: copying a handle
//! is an O(1) refcount bump, and two handles compare equal only when they
//! point at the same asset.
//!
//! Allocation goes through a [`HeavyStore`] that enforces the configured
//! heap capacity (`THEUS_HEAP_SIZE`).

use crate::error::{Result, TheusError};
use parking_lot::Mutex;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The payload behind a heavy handle
#[derive(Debug)]
struct HeavyAsset {
    name: String,
    bytes: Box<[u8]>,
}

/// Refcounted handle to a heavy asset
///
/// Cloning bumps the refcount; the payload is shared. Writing a heavy slot
/// in a transaction replaces the handle atomically at commit.
#[derive(Clone)]
pub struct HeavyHandle {
    inner: Arc<HeavyAsset>,
}

impl HeavyHandle {
    /// Create a handle over an owned payload
    pub fn new(name: impl Into<String>, bytes: impl Into<Box<[u8]>>) -> Self {
        HeavyHandle {
            inner: Arc::new(HeavyAsset {
                name: name.into(),
                bytes: bytes.into(),
            }),
        }
    }

    /// Asset name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.inner.bytes.len()
    }

    /// True if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.inner.bytes.is_empty()
    }

    /// Borrow the payload
    pub fn bytes(&self) -> &[u8] {
        &self.inner.bytes
    }

    /// Number of live handles sharing this asset
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True when both handles point at the same asset
    pub fn same_asset(&self, other: &HeavyHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for HeavyHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_asset(other)
    }
}

impl Eq for HeavyHandle {}

impl fmt::Debug for HeavyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeavyHandle")
            .field("name", &self.inner.name)
            .field("len", &self.inner.bytes.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

// Handles serialize as metadata only; payloads never travel through serde.
// A deserialized handle is detached: same name, empty payload.
impl Serialize for HeavyHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("HeavyHandle", 2)?;
        s.serialize_field("name", self.name())?;
        s.serialize_field("len", &self.len())?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for HeavyHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HandleVisitor;

        impl<'de> Visitor<'de> for HandleVisitor {
            type Value = HeavyHandle;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a heavy handle descriptor")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<HeavyHandle, A::Error> {
                let mut name: Option<String> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "name" => name = Some(map.next_value()?),
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                let name = name.ok_or_else(|| de::Error::missing_field("name"))?;
                Ok(HeavyHandle::new(name, Vec::new()))
            }
        }

        deserializer.deserialize_struct("HeavyHandle", &["name", "len"], HandleVisitor)
    }
}

/// Capacity-checked allocator for heavy assets
///
/// Tracks the total bytes of live allocations against a fixed budget.
/// Replacing an asset under the same name releases the old accounting.
pub struct HeavyStore {
    capacity_bytes: usize,
    allocations: Mutex<HashMap<String, usize>>,
}

impl HeavyStore {
    /// Create a store with the given capacity in megabytes
    pub fn with_capacity_mb(capacity_mb: usize) -> Self {
        HeavyStore {
            capacity_bytes: capacity_mb.saturating_mul(1024 * 1024),
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Total capacity in bytes
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Bytes currently accounted to live allocations
    pub fn used_bytes(&self) -> usize {
        self.allocations.lock().values().sum()
    }

    /// Allocate a named asset, enforcing the capacity budget
    ///
    /// # Errors
    /// Returns `CapacityExceeded` when the allocation would overflow the
    /// configured heap size.
    pub fn alloc(&self, name: impl Into<String>, bytes: impl Into<Box<[u8]>>) -> Result<HeavyHandle> {
        let name = name.into();
        let bytes = bytes.into();
        let size = bytes.len();

        let mut allocations = self.allocations.lock();
        let existing = allocations.get(&name).copied().unwrap_or(0);
        let projected = self.used_bytes_locked(&allocations) - existing + size;
        if projected > self.capacity_bytes {
            return Err(TheusError::capacity_exceeded(
                "heavy heap",
                self.capacity_bytes,
                projected,
            ));
        }
        allocations.insert(name.clone(), size);
        Ok(HeavyHandle::new(name, bytes))
    }

    /// Release the accounting for a named asset
    ///
    /// The payload itself lives as long as handles to it do.
    pub fn free(&self, name: &str) {
        self.allocations.lock().remove(name);
    }

    fn used_bytes_locked(&self, allocations: &HashMap<String, usize>) -> usize {
        allocations.values().sum()
    }
}
