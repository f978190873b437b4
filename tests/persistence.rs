//! Durable cache behaviour across process restarts.

mod helpers;

use accountgeo::app::open_cache;
use accountgeo::cache::Lookup;
use accountgeo::cache::entry::CacheEntry;
use accountgeo::cache::storage::{BlobStorage, FileStorage, MemoryStorage, StoreError};
use accountgeo::coordinator::ResolveOptions;
use accountgeo::utils::unix_millis;
use async_trait::async_trait;
use helpers::{Answer, ScriptedSource, fixture, fixture_with_storage, test_config};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const KEY: &str = "twitter_location_cache";
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

fn blob(storage: &MemoryStorage) -> Value {
    let raw = storage.get(KEY).expect("blob should be written");
    serde_json::from_str(&raw).expect("blob should be valid JSON")
}

#[tokio::test(start_paused = true)]
async fn resolved_locations_survive_a_restart() {
    let source = ScriptedSource::new(Duration::from_millis(100));
    source.script("alice", [Answer::Found("France")]);
    source.script("bob", [Answer::Nothing]);
    let config = test_config(&[("cache_ttl", json!("30d"))]);
    let f = fixture(config.clone(), source).await;

    let coordinator = f.app.coordinator();
    coordinator
        .resolve("alice", ResolveOptions::default())
        .await
        .unwrap();
    coordinator
        .resolve("bob", ResolveOptions::default())
        .await
        .unwrap();
    f.app.shutdown().await;

    let written = blob(&f.storage);
    let alice = &written["alice"];
    assert_eq!(alice["location"]["location"], "France");
    assert_eq!(alice["location"]["locationAccurate"], true);
    assert_eq!(alice["fullProfile"]["screen_name"], "alice");
    let cached_at = alice["cachedAt"].as_i64().unwrap();
    assert_eq!(alice["expiry"].as_i64().unwrap() - cached_at, 30 * DAY_MS);
    assert!(written["bob"]["location"].is_null());

    let restored = open_cache(&config, f.storage.clone() as Arc<dyn BlobStorage>).await;
    assert_eq!(
        restored.lookup("alice"),
        Lookup::Hit(accountgeo::cache::Resolution {
            location: Some("France".into()),
            location_accurate: Some(true),
            full_result: Some(Arc::new(json!({ "screen_name": "alice" }))),
        })
    );
    assert_eq!(restored.lookup("bob"), Lookup::Miss);
}

#[tokio::test]
async fn expired_records_are_not_rehydrated() {
    let now = unix_millis();
    let storage = Arc::new(MemoryStorage::new());
    storage.set(
        KEY,
        json!({
            "fresh": {"location": {"location": "Peru", "locationAccurate": null}, "cachedAt": now, "expiry": now + DAY_MS},
            "stale": {"location": {"location": "Chad", "locationAccurate": true}, "cachedAt": now - 2 * DAY_MS, "expiry": now - DAY_MS},
        })
        .to_string(),
    );

    let cache = open_cache(&test_config(&[]), storage).await;
    assert!(cache.peek("fresh"));
    assert!(!cache.peek("stale"));
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn legacy_and_partial_records_are_normalized() {
    let future = unix_millis() + DAY_MS;
    let storage = Arc::new(MemoryStorage::new());
    storage.set(
        KEY,
        json!({
            "legacy": {"location": "Brazil", "expiry": future},
            "profile_only": {"fullProfile": {"rest_id": "9"}, "expiry": future},
            "empty": {"expiry": future},
            "garbage": 42,
        })
        .to_string(),
    );

    let cache = open_cache(&test_config(&[]), storage).await;
    assert_eq!(
        cache.location("legacy"),
        Some(Some(CacheEntry::new("Brazil", None)))
    );
    assert_eq!(cache.location("profile_only"), Some(None));
    assert_eq!(
        cache.profile("profile_only").as_deref(),
        Some(&json!({ "rest_id": "9" }))
    );
    assert_eq!(cache.location("empty"), None);
    assert_eq!(cache.location("garbage"), None);
}

#[tokio::test]
async fn unreadable_blob_starts_empty() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set(KEY, "{not json");
    let cache = open_cache(&test_config(&[]), storage).await;
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn writes_are_coalesced_behind_the_debounce() {
    let source = ScriptedSource::new(Duration::from_millis(100));
    let f = fixture(
        test_config(&[
            ("save_debounce", json!("5s")),
            ("max_concurrent", json!(3)),
            ("min_interval", json!("0ms")),
        ]),
        source,
    )
    .await;
    for name in ["a", "b", "c"] {
        f.source.script(name, [Answer::Found("Mali")]);
    }
    let cache = f.app.coordinator().cache().clone();

    futures::future::join_all(
        ["a", "b", "c"].map(|n| f.app.coordinator().resolve(n, ResolveOptions::default())),
    )
    .await;
    assert!(cache.store().has_pending_save());
    assert!(f.storage.get(KEY).is_none());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!cache.store().has_pending_save());
    let written = blob(&f.storage);
    assert_eq!(written.as_object().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn torn_down_storage_never_fails_resolution() {
    let storage = Arc::new(MemoryStorage::new());
    let source = ScriptedSource::new(Duration::from_millis(100));
    source.script("alice", [Answer::Found("France")]);
    let f = fixture_with_storage(test_config(&[]), source, storage).await;
    f.storage.close();

    let coordinator = f.app.coordinator();
    let resolved = coordinator
        .resolve("alice", ResolveOptions::default())
        .await
        .unwrap();
    assert!(resolved.is_some());
    coordinator.cache().flush().await;
    coordinator.clear_all().await;
    assert!(!coordinator.peek_cache("alice"));
}

#[tokio::test(start_paused = true)]
async fn clears_are_durable() {
    let source = ScriptedSource::new(Duration::from_millis(100));
    source.script("alice", [Answer::Found("France")]);
    source.script("bob", [Answer::Found("Peru")]);
    let config = test_config(&[]);
    let f = fixture(config.clone(), source).await;
    let coordinator = f.app.coordinator();

    for name in ["alice", "bob"] {
        coordinator
            .resolve(name, ResolveOptions::default())
            .await
            .unwrap();
    }
    coordinator.clear_one("alice").await;
    let written = blob(&f.storage);
    assert!(written.get("alice").is_none());
    assert_eq!(written["bob"]["location"]["location"], "Peru");

    coordinator.clear_all().await;
    assert!(f.storage.get(KEY).is_none());
    assert!(!coordinator.cache().store().has_pending_save());

    let restored = open_cache(&config, f.storage.clone() as Arc<dyn BlobStorage>).await;
    assert!(restored.is_empty());
}

#[tokio::test]
async fn file_storage_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&[]);

    let first = open_cache(&config, Arc::new(FileStorage::new(dir.path()))).await;
    first.record(
        "alice",
        &accountgeo::cache::Resolution {
            location: Some("France".into()),
            location_accurate: None,
            full_result: None,
        },
    );
    first.flush().await;
    assert!(dir.path().join(format!("{KEY}.json")).exists());

    let second = open_cache(&config, Arc::new(FileStorage::new(dir.path()))).await;
    assert!(second.peek("alice"));
}

/// Storage whose writes take a while to land.
struct SlowStorage {
    inner: MemoryStorage,
    write_delay: Duration,
}

#[async_trait]
impl BlobStorage for SlowStorage {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, blob: String) -> Result<(), StoreError> {
        tokio::time::sleep(self.write_delay).await;
        self.inner.write(key, blob).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }
}

fn found(location: &str) -> accountgeo::cache::Resolution {
    accountgeo::cache::Resolution {
        location: Some(location.into()),
        location_accurate: Some(true),
        full_result: None,
    }
}

#[tokio::test(start_paused = true)]
async fn clear_all_wins_over_a_save_already_writing() {
    let storage = Arc::new(SlowStorage {
        inner: MemoryStorage::new(),
        write_delay: Duration::from_secs(1),
    });
    let config = test_config(&[("save_debounce", json!("5s"))]);
    let cache = open_cache(&config, storage.clone()).await;

    cache.record("alice", &found("France"));
    // Debounce elapsed, the save is now inside its slow write.
    tokio::time::sleep(Duration::from_millis(5500)).await;
    cache.clear_all().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(storage.inner.get(KEY).is_none());
    let restored = open_cache(&config, storage).await;
    assert!(restored.is_empty());
}

#[tokio::test(start_paused = true)]
async fn clear_one_is_not_overwritten_by_an_older_save() {
    let storage = Arc::new(SlowStorage {
        inner: MemoryStorage::new(),
        write_delay: Duration::from_secs(1),
    });
    let config = test_config(&[("save_debounce", json!("5s"))]);
    let cache = open_cache(&config, storage.clone()).await;

    cache.record("alice", &found("France"));
    cache.record("bob", &found("Peru"));
    tokio::time::sleep(Duration::from_millis(5500)).await;
    cache.clear_one("alice").await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let written = blob(&storage.inner);
    assert!(written.get("alice").is_none());
    assert_eq!(written["bob"]["location"]["location"], "Peru");
}
