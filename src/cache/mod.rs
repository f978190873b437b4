//! Two-level location cache: bounded in-memory maps backed by a durable blob.
//!
//! The in-memory maps are the only copy consulted while running. They are
//! rebuilt from the blob at startup and flushed back on a debounce timer.

pub mod bounded;
pub mod entry;
pub mod storage;
pub mod store;

use crate::utils::locked;
use bounded::BoundedCache;
use entry::{CacheEntry, FullProfile, LocationSlot};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use storage::BlobStorage;
use store::{PersistentStore, StoreConfig};
use tracing::{debug, trace};

/// The value handed back to callers of a resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub location: Option<String>,
    pub location_accurate: Option<bool>,
    pub full_result: Option<FullProfile>,
}

impl Resolution {
    pub fn has_location(&self) -> bool {
        self.location.as_deref().is_some_and(|l| !l.is_empty())
    }
}

/// Both maps share one lock so a lookup sees a consistent pair.
#[derive(Debug)]
pub struct MemoryCache {
    pub(crate) locations: BoundedCache<String, LocationSlot>,
    pub(crate) profiles: BoundedCache<String, FullProfile>,
}

impl MemoryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            locations: BoundedCache::new(max_size),
            profiles: BoundedCache::new(max_size),
        }
    }
}

pub type SharedMemory = Arc<Mutex<MemoryCache>>;

/// Outcome of a cache consultation on the resolve path.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(Resolution),
    Miss,
}

/// Clone-cheap handle to the caches.
#[derive(Clone)]
pub struct LocationCache {
    memory: SharedMemory,
    store: Arc<PersistentStore>,
}

impl LocationCache {
    pub fn new(max_size: usize, storage: Arc<dyn BlobStorage>, config: StoreConfig) -> Self {
        let memory = Arc::new(Mutex::new(MemoryCache::new(max_size)));
        let store = Arc::new(PersistentStore::new(storage, memory.clone(), config));
        Self { memory, store }
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    /// Rehydrate from durable storage. Call once at startup.
    pub async fn load(&self) -> usize {
        self.store.load().await.len()
    }

    /// Consult the location map for `key`.
    ///
    /// A stored "nothing found" placeholder counts as a miss and is dropped,
    /// so the next resolution fetches again.
    pub fn lookup(&self, key: &str) -> Lookup {
        let mut memory = locked(&self.memory);
        let entry = match memory.locations.get(key) {
            Some(Some(entry)) if entry.is_usable() => entry.clone(),
            Some(_) => {
                memory.locations.remove(key);
                debug!(key, "Purged empty cached location");
                return Lookup::Miss;
            }
            None => return Lookup::Miss,
        };

        trace!(key, "Location cache hit");
        Lookup::Hit(Resolution {
            location: entry.location,
            location_accurate: entry.location_accurate,
            full_result: memory.profiles.get(key).cloned(),
        })
    }

    /// Whether a usable location is cached for `key`. No side effects.
    pub fn peek(&self, key: &str) -> bool {
        locked(&self.memory)
            .locations
            .get(key)
            .is_some_and(|slot| slot.as_ref().is_some_and(CacheEntry::is_usable))
    }

    /// Raw location slot, including "nothing found" placeholders.
    pub fn location(&self, key: &str) -> Option<LocationSlot> {
        locked(&self.memory).locations.get(key).cloned()
    }

    pub fn profile(&self, key: &str) -> Option<FullProfile> {
        locked(&self.memory).profiles.get(key).cloned()
    }

    /// Write a fresh resolution through to memory and schedule a durable save.
    pub fn record(&self, key: &str, resolution: &Resolution) {
        {
            let mut memory = locked(&self.memory);
            let slot = resolution.has_location().then(|| CacheEntry {
                location: resolution.location.clone(),
                location_accurate: resolution.location_accurate,
            });
            if let Some(evicted) = memory.locations.put(key.to_owned(), slot) {
                trace!(evicted = %evicted, "Evicted oldest cached location");
            }
            if let Some(profile) = &resolution.full_result
                && let Some(evicted) = memory.profiles.put(key.to_owned(), profile.clone())
            {
                trace!(evicted = %evicted, "Evicted oldest cached profile");
            }
        }
        self.store.schedule_save();
    }

    /// Drop every cached entry, in memory and durably.
    pub async fn clear_all(&self) {
        {
            let mut memory = locked(&self.memory);
            memory.locations.clear();
            memory.profiles.clear();
        }
        self.store.clear().await;
        debug!("Cleared all cached locations");
    }

    /// Drop one key, in memory and durably.
    pub async fn clear_one(&self, key: &str) {
        {
            let mut memory = locked(&self.memory);
            memory.locations.remove(key);
            memory.profiles.remove(key);
        }
        self.store.flush().await;
        debug!(key, "Cleared cached location");
    }

    /// Persist now instead of waiting for the debounce timer.
    pub async fn flush(&self) {
        self.store.flush().await;
    }

    pub fn len(&self) -> usize {
        locked(&self.memory).locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn profile_count(&self) -> usize {
        locked(&self.memory).profiles.len()
    }

    /// Location slots from oldest to newest insertion.
    pub fn snapshot(&self) -> IndexMap<String, LocationSlot> {
        locked(&self.memory)
            .locations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
