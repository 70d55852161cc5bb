//! Per-slot commit leases
//!
//! Anything that changes a slot's files together with its record holds the
//! slot's lease for the whole change: ingestion commits, deletion,
//! regeneration and retention pruning.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct SlotLeases {
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SlotLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `slot`.
    pub async fn acquire(&self, slot: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(slot.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the entry for a deleted slot if nobody holds or awaits it.
    pub fn forget(&self, slot: &str) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(slot) {
            // Only the map holds it: nobody is waiting.
            if Arc::strong_count(lock) == 1 {
                locks.remove(slot);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
