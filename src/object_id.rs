//! Object identity tracking
//!
//! Traps are keyed by the identity of the object a guarded API touches. The
//! tracker hands out a process-unique [`ObjectId`] for each instance the
//! first time it is observed and returns the same id on every later
//! observation of that instance.
//!
//! Instances are keyed by address only. The tracker never holds a reference
//! to the object itself, so tracking cannot keep anything alive. When an
//! object is dropped its owner may call [`ObjectTracker::forget`] so that a
//! new allocation at the same address receives a fresh identity.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identity of a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId(pub(crate) u64);

impl ObjectId {
    /// Sentinel shared by every static-scope operation
    pub const STATIC: ObjectId = ObjectId(0);

    /// Raw numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the static-scope sentinel
    pub fn is_static(self) -> bool {
        self == Self::STATIC
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-owning reference to an instance, as supplied by instrumented code
///
/// Only the address is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceRef(usize);

impl InstanceRef {
    /// Capture the address of an instance
    pub fn of<T: ?Sized>(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }

    /// Build from a raw address handed over by the instrumentation layer
    pub fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// The captured address
    pub fn addr(self) -> usize {
        self.0
    }
}

/// Address-keyed identity arena
#[derive(Debug)]
pub struct ObjectTracker {
    ids: Mutex<HashMap<InstanceRef, ObjectId>>,
    next: AtomicU64,
}

impl Default for ObjectTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTracker {
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(HashMap::new()),
            // 0 is reserved for ObjectId::STATIC
            next: AtomicU64::new(1),
        }
    }

    /// Identity of an instance, or the static sentinel for `None`
    pub fn id_of(&self, instance: Option<InstanceRef>) -> ObjectId {
        match instance {
            None => ObjectId::STATIC,
            Some(instance) => *self
                .ids
                .lock()
                .entry(instance)
                .or_insert_with(|| ObjectId(self.next.fetch_add(1, Ordering::Relaxed))),
        }
    }

    /// Drop the mapping for an instance that has been reclaimed
    pub fn forget(&self, instance: InstanceRef) -> Option<ObjectId> {
        self.ids.lock().remove(&instance)
    }

    /// Number of instances currently tracked
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
