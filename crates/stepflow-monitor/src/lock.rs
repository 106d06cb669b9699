//! Per-key async mutexes serializing read-modify-write cycles.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        mutex.lock_owned().await
    }

    /// Drops the mutex for `key` unless someone holds or awaits it.
    pub fn forget(&self, key: &str) {
        self.locks.remove_if(key, |_, m| Arc::strong_count(m) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
