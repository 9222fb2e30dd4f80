//! In-memory table of current device values.
//!
//! The store is the only owner of [`ValueModel`]s. Every mutation goes through
//! [`StateStore::apply`], which enforces generation ordering so that late or
//! duplicated reports from the mesh network never roll state backwards.
//!
//! Locking is two-level: a `RwLock` guards the key set and each entry has its
//! own `Mutex`, so updates to unrelated values never contend.

use crate::model::{NodeId, ValueId, ValueModel, ValueUpdate};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of [`StateStore::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeResult {
    /// The update was accepted and changed visible state.
    Applied(ValueModel),
    /// Same content as already stored; nothing to publish.
    Unchanged,
    /// Generation not newer than the stored one; dropped.
    Stale,
}

impl ChangeResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, ChangeResult::Applied(_))
    }
}

type Slot = Arc<Mutex<ValueModel>>;

#[derive(Default)]
pub struct StateStore {
    entries: RwLock<HashMap<ValueId, Slot>>,
    stale_updates: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a reported update to one value.
    pub fn apply(&self, id: &ValueId, update: ValueUpdate) -> ChangeResult {
        let existing = self.entries.read().get(id).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut entries = self.entries.write();
                match entries.entry(id.clone()) {
                    Entry::Occupied(occupied) => occupied.get().clone(),
                    Entry::Vacant(vacant) => {
                        let model = ValueModel::from_update(id.clone(), update);
                        debug!("[State] New value {} = {}", id, model.value);
                        vacant.insert(Arc::new(Mutex::new(model.clone())));
                        return ChangeResult::Applied(model);
                    }
                }
            }
        };

        let mut current = slot.lock();
        self.merge(&mut current, update)
    }

    fn merge(&self, current: &mut ValueModel, update: ValueUpdate) -> ChangeResult {
        if update.generation < current.generation {
            return self.stale(current, &update);
        }

        if current.same_content(&update) {
            // Keep the newest generation so an older, different report can't win later.
            if update.generation > current.generation {
                current.generation = update.generation;
                current.updated_at = update.timestamp;
            }
            return ChangeResult::Unchanged;
        }

        if update.generation == current.generation {
            return self.stale(current, &update);
        }

        current.value = update.value;
        current.units = update.units;
        current.choices = update.choices;
        current.read_only = update.read_only;
        current.updated_at = update.timestamp;
        current.generation = update.generation;
        ChangeResult::Applied(current.clone())
    }

    fn stale(&self, current: &ValueModel, update: &ValueUpdate) -> ChangeResult {
        self.stale_updates.fetch_add(1, Ordering::Relaxed);
        trace!(
            "[State] Dropped stale update for {} (generation {} <= {})",
            current.id, update.generation, current.generation
        );
        ChangeResult::Stale
    }

    pub fn get(&self, id: &ValueId) -> Option<ValueModel> {
        let slot = self.entries.read().get(id).cloned()?;
        let model = slot.lock().clone();
        Some(model)
    }

    pub fn contains(&self, id: &ValueId) -> bool {
        self.entries.read().contains_key(id)
    }

    /// All current values, ordered by id.
    pub fn snapshot(&self) -> Vec<ValueModel> {
        let slots: Vec<Slot> = self.entries.read().values().cloned().collect();
        let mut models: Vec<ValueModel> = slots.iter().map(|slot| slot.lock().clone()).collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Drop every value of a node. Returns the removed ids.
    pub fn remove_node(&self, node: NodeId) -> Vec<ValueId> {
        let mut entries = self.entries.write();
        let mut removed: Vec<ValueId> = entries.keys().filter(|id| id.node == node).cloned().collect();
        for id in &removed {
            entries.remove(id);
        }
        removed.sort();
        removed
    }

    pub fn remove_value(&self, id: &ValueId) -> bool {
        self.entries.write().remove(id).is_some()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.entries.read().keys().map(|id| id.node).collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of updates dropped for being out of order.
    pub fn stale_count(&self) -> u64 {
        self.stale_updates.load(Ordering::Relaxed)
    }
}
