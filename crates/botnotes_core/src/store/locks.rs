//! Per-key mutual exclusion for note mutations.

use crate::model::note::NoteKey;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type KeyGuard = ArcMutexGuard<RawMutex, ()>;

/// Lazily allocated lock per note key.
///
/// Slots nobody holds or waits on are dropped on the next acquisition.
#[derive(Default)]
pub(crate) struct KeyLocks {
    slots: Mutex<HashMap<NoteKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub(crate) fn lock(&self, key: &NoteKey) -> KeyGuard {
        let slot = {
            let mut slots = self.slots.lock();
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        slot.lock_arc()
    }

    /// Locks several keys in sorted order so overlapping callers cannot deadlock.
    pub(crate) fn lock_many(&self, keys: &[NoteKey]) -> Vec<KeyGuard> {
        let mut ordered = keys.to_vec();
        ordered.sort();
        ordered.dedup();
        ordered.iter().map(|key| self.lock(key)).collect()
    }
}
