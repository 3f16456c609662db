//! Capability Space - Per-PD capability namespace
//!
//! A selector names exactly one kernel object, and a space holds at most
//! one selector per object. The reverse map makes the "find an existing
//! selector for this object" lookup used during capability translation
//! O(log n).

use alloc::collections::BTreeMap;

use crate::error::{KernResult, KernelError};
use crate::kern::id_alloc::IdAllocator;
use crate::types::{CapId, ObjRef, ObjectId};

/// Capability space of one protection domain
#[derive(Debug, Clone)]
pub struct CapSpace {
    entries: BTreeMap<CapId, ObjRef>,
    reverse: BTreeMap<ObjRef, CapId>,
    ids: IdAllocator,
}

impl CapSpace {
    /// Create an empty space holding up to `capacity` selectors
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            reverse: BTreeMap::new(),
            ids: IdAllocator::new(1, capacity),
        }
    }

    /// Object named by `cap`
    pub fn lookup(&self, cap: CapId) -> Option<ObjRef> {
        self.entries.get(&cap).copied()
    }

    /// Existing selector of `obj`
    pub fn find(&self, obj: ObjRef) -> Option<CapId> {
        self.reverse.get(&obj).copied()
    }

    /// Selector for `obj`, reusing an existing entry
    pub fn insert(&mut self, obj: ObjRef) -> KernResult<CapId> {
        if let Some(cap) = self.find(obj) {
            return Ok(cap);
        }
        let cap = self
            .ids
            .alloc()
            .map(CapId)
            .ok_or(KernelError::OutOfResources)?;
        self.entries.insert(cap, obj);
        self.reverse.insert(obj, cap);
        Ok(cap)
    }

    /// Drop the selector `cap`
    pub fn remove(&mut self, cap: CapId) -> Option<ObjRef> {
        let obj = self.entries.remove(&cap)?;
        self.reverse.remove(&obj);
        self.ids.free(cap.0);
        Some(obj)
    }

    /// Drop every selector naming any generation of `id`
    pub fn purge(&mut self, id: ObjectId) {
        let stale: alloc::vec::Vec<CapId> = self
            .entries
            .iter()
            .filter(|(_, obj)| obj.id == id)
            .map(|(&cap, _)| cap)
            .collect();
        for cap in stale {
            self.remove(cap);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in selector order
    pub fn iter(&self) -> impl Iterator<Item = (CapId, ObjRef)> + '_ {
        self.entries.iter().map(|(&cap, &obj)| (cap, obj))
    }
}
