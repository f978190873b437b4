//! Cached value shapes: the in-memory entry and the durable record.

use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

/// Self-reported account location for one username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub location: Option<String>,
    /// `Some(false)` when the remote side flags the location as suspect
    /// (e.g. connected through a proxy). `None` when unknown.
    pub location_accurate: Option<bool>,
}

impl CacheEntry {
    pub fn new(location: impl Into<String>, location_accurate: Option<bool>) -> Self {
        Self {
            location: Some(location.into()),
            location_accurate,
        }
    }

    /// Whether this entry carries an actual location worth showing.
    pub fn is_usable(&self) -> bool {
        self.location.as_deref().is_some_and(|l| !l.is_empty())
    }
}

/// Opaque rich-profile document returned by the remote endpoint.
///
/// Shared behind an `Arc` since it is fanned out to every waiter and can be
/// large.
pub type FullProfile = Arc<serde_json::Value>;

/// Value held in the location map: `None` means "looked up, nothing found".
pub type LocationSlot = Option<CacheEntry>;

/// On-disk shape of one username inside the persisted blob.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub location: LocationSlot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_profile: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    pub cached_at: i64,
    /// `cached_at + ttl`, fixed at write time.
    pub expiry: i64,
}

impl PersistedRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry <= now_ms
    }
}

/// A record as found on disk, before normalization.
///
/// Older writers stored the location as a bare string, and some records were
/// written with the `location` field missing altogether. Both are accepted.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredRecord {
    #[serde(default, deserialize_with = "present")]
    location: Option<StoredLocation>,
    #[serde(default)]
    full_profile: Option<serde_json::Value>,
    #[serde(default)]
    cached_at: i64,
    #[serde(default)]
    expiry: i64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredLocation {
    Entry(CacheEntry),
    Legacy(String),
    Null,
}

/// Distinguish a field that is present-but-null from one that is absent.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl StoredRecord {
    /// Upgrade to the current shape.
    ///
    /// Returns `None` for records that carry neither a location (not even an
    /// explicit null) nor a full profile.
    pub(crate) fn normalize(self) -> Option<PersistedRecord> {
        let location = match self.location {
            Some(StoredLocation::Entry(entry)) => Some(Some(entry)),
            Some(StoredLocation::Legacy(location)) => Some(Some(CacheEntry::new(location, None))),
            Some(StoredLocation::Null) => Some(None),
            None => None,
        };

        let full_profile = self.full_profile.filter(|p| !p.is_null());
        if location.is_none() && full_profile.is_none() {
            return None;
        }

        Some(PersistedRecord {
            location: location.flatten(),
            full_profile,
            cached_at: self.cached_at,
            expiry: self.expiry,
        })
    }
}
