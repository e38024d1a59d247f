//! Keyed async locks: one mutex per project or slice id.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Lazily created per-key `tokio::sync::Mutex`es.
///
/// Entries are never removed; the key space (projects, slices) is small and
/// long-lived.
pub struct KeyedLocks<K> {
    table: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.entry(key.clone()).or_default().clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Exclusive access to `key` if nobody holds it.
    pub fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }
}
