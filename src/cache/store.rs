//! Durable snapshot of the in-memory caches.
//!
//! The whole cache lives in one JSON blob under a fixed storage key:
//!
//! ```text
//! { "<username>": { "location": {..} | null, "fullProfile"?: {..}, "cachedAt": ms, "expiry": ms } }
//! ```
//!
//! The blob is read once at startup and rewritten on a debounce timer. Every
//! save stamps a fresh `expiry = now + ttl` on every record. Failures here are
//! logged and swallowed; they never reach the resolution path.

use super::entry::{PersistedRecord, StoredRecord};
use super::storage::{BlobStorage, StoreError};
use super::SharedMemory;
use crate::json::parse_json_with_context;
use crate::utils::{fmt_duration, locked, unix_millis};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Key of the single blob inside the backend.
    pub storage_key: String,
    pub ttl: Duration,
    pub save_debounce: Duration,
}

pub struct PersistentStore {
    storage: Arc<dyn BlobStorage>,
    memory: SharedMemory,
    config: StoreConfig,
    /// At most one debounced save is outstanding at a time.
    pending_flush: Mutex<Option<PendingFlush>>,
    generation: AtomicU64,
    /// Serializes snapshot+write against removal so a slow save can never
    /// land after a clear.
    write_gate: tokio::sync::Mutex<()>,
}

/// A scheduled save, tagged so a timer that outlived its cancellation can
/// tell it no longer owns the slot.
struct PendingFlush {
    generation: u64,
    handle: JoinHandle<()>,
}

impl PersistentStore {
    pub fn new(storage: Arc<dyn BlobStorage>, memory: SharedMemory, config: StoreConfig) -> Self {
        Self {
            storage,
            memory,
            config,
            pending_flush: Mutex::new(None),
            generation: AtomicU64::new(0),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read the blob and rehydrate every unexpired record into memory.
    ///
    /// Returns the records that were rehydrated, in blob order.
    pub async fn load(&self) -> IndexMap<String, PersistedRecord> {
        let records = match self.read_records().await {
            Ok(records) => records,
            Err(e) => {
                report("load", &e);
                return IndexMap::new();
            }
        };

        let now = unix_millis();
        let total = records.len();
        let live: IndexMap<String, PersistedRecord> = records
            .into_iter()
            .filter(|(_, record)| !record.is_expired(now))
            .collect();

        {
            let mut memory = locked(&self.memory);
            for (key, record) in &live {
                memory.locations.put(key.clone(), record.location.clone());
                if let Some(profile) = &record.full_profile {
                    memory.profiles.put(key.clone(), Arc::new(profile.clone()));
                }
            }
        }

        info!(
            loaded = live.len(),
            expired = total - live.len(),
            "Loaded persisted location cache"
        );
        live
    }

    /// Decode the stored blob, dropping malformed and empty records.
    async fn read_records(&self) -> Result<IndexMap<String, PersistedRecord>, StoreError> {
        let Some(blob) = self.storage.read(&self.config.storage_key).await? else {
            return Ok(IndexMap::new());
        };

        let raw: IndexMap<String, serde_json::Value> =
            parse_json_with_context(&blob).map_err(StoreError::Malformed)?;

        let mut records = IndexMap::with_capacity(raw.len());
        for (key, value) in raw {
            match serde_json::from_value::<StoredRecord>(value) {
                Ok(stored) => {
                    if let Some(record) = stored.normalize() {
                        records.insert(key, record);
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping malformed cache record"),
            }
        }
        Ok(records)
    }

    /// Serialize both in-memory maps and overwrite the blob.
    pub async fn save(&self) {
        let _gate = self.write_gate.lock().await;
        let (blob, count) = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                report("save", &e);
                return;
            }
        };

        match self.storage.write(&self.config.storage_key, blob).await {
            Ok(()) => debug!(entries = count, "Location cache saved"),
            Err(e) => report("save", &e),
        }
    }

    fn snapshot(&self) -> Result<(String, usize), StoreError> {
        let now = unix_millis();
        let ttl_ms = i64::try_from(self.config.ttl.as_millis()).unwrap_or(i64::MAX);
        let expiry = now.saturating_add(ttl_ms);

        let memory = locked(&self.memory);
        let mut records: IndexMap<&str, PersistedRecord> =
            IndexMap::with_capacity(memory.locations.len());

        for (key, slot) in memory.locations.iter() {
            records.insert(
                key.as_str(),
                PersistedRecord {
                    location: slot.clone(),
                    full_profile: memory.profiles.get(key).map(|p| p.as_ref().clone()),
                    cached_at: now,
                    expiry,
                },
            );
        }
        for (key, profile) in memory.profiles.iter() {
            records.entry(key.as_str()).or_insert_with(|| PersistedRecord {
                location: None,
                full_profile: Some(profile.as_ref().clone()),
                cached_at: now,
                expiry,
            });
        }

        let blob = serde_json::to_string(&records)?;
        Ok((blob, records.len()))
    }

    /// Arrange for [`save`](Self::save) to run after the debounce delay.
    ///
    /// No-op while a save is already scheduled, so a burst of writes results
    /// in a single save.
    pub fn schedule_save(self: &Arc<Self>) {
        let mut pending = locked(&self.pending_flush);
        if pending.is_some() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(store.config.save_debounce).await;
            // Release the slot before saving so writes that land during the
            // save get their own timer.
            if !store.claim(generation) {
                return;
            }
            store.save().await;
        });
        *pending = Some(PendingFlush { generation, handle });
        debug!(
            delay = fmt_duration(self.config.save_debounce),
            "Scheduled cache save"
        );
    }

    /// Take the pending slot if it still belongs to timer `generation`.
    ///
    /// Fails for a timer that was cancelled after its sleep had already
    /// completed, leaving any newer timer in place.
    fn claim(&self, generation: u64) -> bool {
        let mut pending = locked(&self.pending_flush);
        if pending.as_ref().is_some_and(|p| p.generation == generation) {
            pending.take();
            true
        } else {
            false
        }
    }

    pub fn has_pending_save(&self) -> bool {
        locked(&self.pending_flush).is_some()
    }

    /// Cancel a scheduled save, if any. Returns whether one was pending.
    pub fn cancel_scheduled(&self) -> bool {
        match locked(&self.pending_flush).take() {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Save immediately, superseding any scheduled save.
    pub async fn flush(&self) {
        self.cancel_scheduled();
        self.save().await;
    }

    /// Delete the blob entirely.
    pub async fn clear(&self) {
        self.cancel_scheduled();
        let _gate = self.write_gate.lock().await;
        if let Err(e) = self.storage.remove(&self.config.storage_key).await {
            report("clear", &e);
        }
    }
}

/// Log a persistence failure. Shutdown-related conditions stay quiet.
fn report(operation: &'static str, e: &StoreError) {
    if e.is_benign() {
        debug!(operation, error = %e, "Persistence unavailable, skipping");
    } else {
        error!(
            operation,
            severity = "error",
            error = ?e,
            "Persistent cache operation failed"
        );
    }
}
