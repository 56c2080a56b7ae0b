//! Guarded registry of per-collection locks.
//!
//! One process-wide mutex protects the map itself; each entry carries its
//! own mutex guarding the collection state and substores. Read-or-create
//! always happens under the guard, so two threads racing on a fresh
//! `(tenant, name)` converge on the same slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::collection::Collection;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub tenant: String,
    pub name: String,
}

impl CollectionKey {
    pub fn new(tenant: &str, name: &str) -> Self {
        Self { tenant: tenant.to_string(), name: name.to_string() }
    }
}

/// Lifecycle state, checked after acquiring the slot lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollState {
    /// Not loaded in this process (may or may not exist on disk).
    Vacant,
    Initializing,
    Ready,
    Writing,
    Deleting,
}

pub struct SlotCell {
    pub state: CollState,
    pub coll: Option<Collection>,
}

pub struct Slot {
    cell: Mutex<SlotCell>,
}

impl Slot {
    fn new() -> Self {
        Self { cell: Mutex::new(SlotCell { state: CollState::Vacant, coll: None }) }
    }

    /// The collection lock. Poisoning is unrecoverable state corruption, so
    /// it propagates as a panic rather than limping on.
    pub fn lock(&self) -> MutexGuard<'_, SlotCell> {
        self.cell.lock().expect("collection lock poisoned")
    }
}

#[derive(Default)]
pub struct Registry {
    guard: Mutex<HashMap<CollectionKey, Arc<Slot>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-or-create under the guard lock; the slot's own lock is taken by
    /// the caller afterwards, never while the guard is held.
    pub fn slot(&self, key: &CollectionKey) -> Arc<Slot> {
        let mut map = self.guard.lock().expect("registry guard poisoned");
        Arc::clone(map.entry(key.clone()).or_insert_with(|| Arc::new(Slot::new())))
    }

    pub fn remove(&self, key: &CollectionKey) {
        let mut map = self.guard.lock().expect("registry guard poisoned");
        map.remove(key);
    }
}
