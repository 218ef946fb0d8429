//! Per-worker cache of the latest registry revision seen per (key, tweak).
//! Lets a worker notice a host serving older data than it once proved.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::seq::IteratorRandom;

use crate::config::REGISTRY_CACHE_SIZE;
use crate::crypto::Hash;
use crate::types::PublicKey;

/// Bounded revision cache. Eviction removes a random entry, so no access
/// pattern can pin the cache.
pub struct RegistryCache {
    entries: Mutex<HashMap<(PublicKey, Hash), u64>>,
    capacity: usize,
}

impl RegistryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(REGISTRY_CACHE_SIZE)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    #[must_use]
    pub fn get(&self, pk: &PublicKey, tweak: &Hash) -> Option<u64> {
        self.entries.lock().get(&(*pk, *tweak)).copied()
    }

    /// Record a revision. The cache only ever moves forward; a lower
    /// revision than the cached one is ignored.
    pub fn set_if_higher(&self, pk: &PublicKey, tweak: &Hash, revision: u64) {
        let mut entries = self.entries.lock();
        let key = (*pk, *tweak);
        match entries.get_mut(&key) {
            Some(cached) => {
                if revision > *cached {
                    *cached = revision;
                }
            }
            None => {
                if entries.len() >= self.capacity {
                    if let Some(victim) = entries.keys().choose(&mut rand::thread_rng()).copied() {
                        entries.remove(&victim);
                    }
                }
                entries.insert(key, revision);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RegistryCache {
    fn default() -> Self {
        Self::new()
    }
}
