//! Per-document write serialization.
//!
//! Writers to the same document id queue on one async mutex; unrelated ids
//! never contend. Entries are dropped from the map once the last holder or
//! waiter lets go, so the map only contains ids with in-flight writes.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default, Clone)]
pub(crate) struct DocumentLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Exclusive hold on one document key.
pub(crate) struct DocumentGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Lock a single normalized document key.
    pub(crate) async fn lock(&self, key: &str) -> DocumentGuard {
        // No shard lock may be held across the await
        let mutex = self.locks.entry(key.to_string()).or_default().value().clone();
        let guard = mutex.lock_owned().await;
        DocumentGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Lock several keys. Callers must always go through here for multi-key
    /// holds so that every task acquires in the same (sorted) order.
    pub(crate) async fn lock_many(&self, keys: BTreeSet<String>) -> Vec<DocumentGuard> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(&key).await);
        }
        guards
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or waits on it
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
