//! Shared fixtures: a scripted location source and a fully wired app.

#![allow(dead_code)]

use accountgeo::app::App;
use accountgeo::cache::storage::{BlobStorage, MemoryStorage};
use accountgeo::config::Config;
use accountgeo::peer::{LocationSource, SourceError, SourceReply};
use accountgeo::utils::{locked, unix_seconds};
use async_trait::async_trait;
use figment::Figment;
use figment::providers::Serialized;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// One scripted answer for a screen name.
#[derive(Debug, Clone)]
pub enum Answer {
    Found(&'static str),
    /// Lookup succeeded but the account reports no location.
    Nothing,
    /// Throttled until `now + secs`.
    RateLimited(i64),
    Fail(u16),
    /// Never answers in time.
    Hang,
}

/// A [`LocationSource`] that replays scripted answers and records every call.
///
/// Answers queued for a name are consumed in order; the last one repeats.
pub struct ScriptedSource {
    answers: Mutex<HashMap<String, VecDeque<Answer>>>,
    latency: Duration,
    calls: Mutex<Vec<(String, Instant)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(HashMap::new()),
            latency,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, name: &str, answers: impl IntoIterator<Item = Answer>) {
        locked(&self.answers)
            .entry(name.to_owned())
            .or_default()
            .extend(answers);
    }

    pub fn call_count(&self) -> usize {
        locked(&self.calls).len()
    }

    pub fn calls_for(&self, name: &str) -> usize {
        locked(&self.calls).iter().filter(|(n, _)| n == name).count()
    }

    /// When each lookup started, in order.
    pub fn starts(&self) -> Vec<(String, Instant)> {
        locked(&self.calls).clone()
    }

    /// Most lookups ever running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_answer(&self, name: &str) -> Answer {
        let mut answers = locked(&self.answers);
        match answers.get_mut(name) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Answer::Nothing),
            Some(queue) => queue.front().cloned().unwrap_or(Answer::Nothing),
            None => Answer::Nothing,
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocationSource for ScriptedSource {
    async fn lookup(&self, screen_name: &str) -> Result<SourceReply, SourceError> {
        locked(&self.calls).push((screen_name.to_owned(), Instant::now()));
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let answer = self.next_answer(screen_name);
        if matches!(answer, Answer::Hang) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        } else {
            tokio::time::sleep(self.latency).await;
        }

        match answer {
            Answer::Found(location) => Ok(SourceReply {
                location: Some(location.to_owned()),
                location_accurate: Some(true),
                full_result: Some(json!({ "screen_name": screen_name })),
            }),
            Answer::Nothing | Answer::Hang => Ok(SourceReply::default()),
            Answer::RateLimited(secs) => Err(SourceError::RateLimited {
                reset_at: unix_seconds() + secs,
            }),
            Answer::Fail(status) => Err(SourceError::Status {
                status,
                body: "scripted failure".to_owned(),
            }),
        }
    }
}

/// Config tuned for tests: fast pacing, short timeouts.
pub fn test_config(overrides: &[(&str, serde_json::Value)]) -> Config {
    let mut figment = Figment::new()
        .merge(Serialized::default("min_interval", "100ms"))
        .merge(Serialized::default("drain_cooldown", "10ms"))
        .merge(Serialized::default("bridge_timeout", "10s"))
        .merge(Serialized::default("save_debounce", "5s"));
    for (key, value) in overrides {
        figment = figment.merge(Serialized::default(key, value.clone()));
    }
    Config::from_figment(figment).expect("test config should be valid")
}

pub struct Fixture {
    pub app: App,
    pub source: Arc<ScriptedSource>,
    pub storage: Arc<MemoryStorage>,
}

pub async fn fixture(config: Config, source: Arc<ScriptedSource>) -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    fixture_with_storage(config, source, storage).await
}

pub async fn fixture_with_storage(
    config: Config,
    source: Arc<ScriptedSource>,
    storage: Arc<MemoryStorage>,
) -> Fixture {
    let app = App::with_source(
        config,
        source.clone() as Arc<dyn LocationSource>,
        storage.clone() as Arc<dyn BlobStorage>,
    )
    .await;
    Fixture {
        app,
        source,
        storage,
    }
}
