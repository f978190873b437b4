//! Request coordination: single-flight, pacing, concurrency and backoff.
//!
//! Every resolution goes through [`Coordinator::resolve`]:
//!
//! 1. A usable cached location answers immediately (unless forced). A cached
//!    "nothing found" placeholder is purged and treated as a miss.
//! 2. If the key is already pending, the caller joins it as a waiter.
//! 3. Otherwise a new pending request is queued and the drain loop is kicked.
//!
//! The drain loop hands queued keys to the bridge in FIFO order, never more
//! than `max_concurrent` at once, never two dispatches closer than
//! `min_interval`, and not at all while a rate-limit backoff is active.
//! Per key: `queued → in flight → settled`, and a key is never in flight twice.

mod pending;

use crate::bridge::{BridgeError, FetchBridge, FetchOutcome};
use crate::cache::{LocationCache, Lookup, Resolution};
use crate::utils::{fmt_duration, locked};
use pending::{PendingRequest, PendingState};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, trace, warn};

/// Floor for the rate-limit re-check interval.
const MIN_BACKOFF_CHECK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_concurrent: usize,
    /// Minimum spacing between dispatch starts.
    pub min_interval: Duration,
    /// Delay before the loop re-ticks after a request settles.
    pub drain_cooldown: Duration,
    /// Longest single sleep while rate limited.
    pub max_backoff_check: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            min_interval: Duration::from_secs(2),
            drain_cooldown: Duration::from_millis(200),
            max_backoff_check: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Skip the cache-hit shortcut.
    pub force: bool,
}

impl ResolveOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("lookup for {key} failed")]
    Fetch {
        key: String,
        #[source]
        source: Arc<BridgeError>,
    },
    #[error("coordinator shut down before {key} was resolved")]
    Shutdown { key: String },
}

/// What every caller of one pending request receives.
pub type Settlement = Result<Option<Resolution>, ResolveError>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub queued: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub dispatched: u64,
    pub cached_locations: usize,
    pub cached_profiles: usize,
    /// Unix seconds.
    pub rate_limited_until: Option<i64>,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<String>,
    pending: HashMap<String, PendingRequest>,
    in_flight: usize,
    last_dispatch: Option<Instant>,
    loop_running: bool,
    shut_down: bool,
    dispatched: u64,
}

/// Next action for the drain loop, decided under the state lock.
enum Step {
    Stop,
    Wait(Duration),
    Dispatch(String),
}

struct Inner {
    cache: LocationCache,
    bridge: Arc<FetchBridge>,
    config: CoordinatorConfig,
    state: Mutex<State>,
}

/// Clone-cheap handle; all clones share one queue, pending set and cache.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(cache: LocationCache, bridge: Arc<FetchBridge>, config: CoordinatorConfig) -> Self {
        let config = CoordinatorConfig {
            max_concurrent: config.max_concurrent.max(1),
            max_backoff_check: config.max_backoff_check.max(MIN_BACKOFF_CHECK),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                cache,
                bridge,
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn cache(&self) -> &LocationCache {
        &self.inner.cache
    }

    pub fn bridge(&self) -> &Arc<FetchBridge> {
        &self.inner.bridge
    }

    /// Resolve `key` to a location.
    ///
    /// `Ok(None)` means no answer is available right now (timeout or
    /// throttling); callers may retry later. A failed lookup rejects every
    /// caller waiting on that key with the same error.
    pub async fn resolve(&self, key: &str, options: ResolveOptions) -> Settlement {
        let rx = {
            let mut state = locked(&self.inner.state);
            if state.shut_down {
                return Err(ResolveError::Shutdown {
                    key: key.to_owned(),
                });
            }

            if !options.force
                && let Lookup::Hit(resolution) = self.inner.cache.lookup(key)
            {
                return Ok(Some(resolution));
            }

            match state.pending.get_mut(key) {
                Some(request) => {
                    let rx = request.attach();
                    debug!(
                        key,
                        waiters = request.audience(),
                        in_flight = request.state() == PendingState::InFlight,
                        "Joined pending request"
                    );
                    rx
                }
                None => {
                    let (request, rx) = PendingRequest::new(key);
                    state.pending.insert(key.to_owned(), request);
                    state.queue.push_back(key.to_owned());
                    trace!(key, queued = state.queue.len(), "Queued new request");
                    rx
                }
            }
        };

        Inner::kick(&self.inner);

        rx.await.unwrap_or_else(|_| {
            Err(ResolveError::Shutdown {
                key: key.to_owned(),
            })
        })
    }

    /// Whether a usable location is cached for `key`.
    pub fn peek_cache(&self, key: &str) -> bool {
        self.inner.cache.peek(key)
    }

    pub async fn clear_all(&self) {
        self.inner.cache.clear_all().await;
    }

    pub async fn clear_one(&self, key: &str) {
        self.inner.cache.clear_one(key).await;
    }

    pub fn stats(&self) -> CoordinatorStats {
        let (queued, pending, in_flight, dispatched) = {
            let state = locked(&self.inner.state);
            (
                state.queue.len(),
                state.pending.len(),
                state.in_flight,
                state.dispatched,
            )
        };
        CoordinatorStats {
            queued,
            pending,
            in_flight,
            dispatched,
            cached_locations: self.inner.cache.len(),
            cached_profiles: self.inner.cache.profile_count(),
            rate_limited_until: self.inner.bridge.rate_limit().reset_at(),
        }
    }

    /// Abandon all queued and in-flight work and stop accepting new work.
    ///
    /// Every outstanding caller is rejected with [`ResolveError::Shutdown`].
    pub fn shutdown(&self) {
        let abandoned: Vec<PendingRequest> = {
            let mut state = locked(&self.inner.state);
            state.shut_down = true;
            state.queue.clear();
            state.pending.drain().map(|(_, request)| request).collect()
        };

        let count = abandoned.len();
        for request in abandoned {
            request.abandon();
        }
        self.inner.bridge.shutdown();
        info!(abandoned = count, "Coordinator shut down");
    }
}

impl Inner {
    /// Start the drain loop unless it is already running.
    fn kick(this: &Arc<Self>) {
        {
            let mut state = locked(&this.state);
            if state.loop_running || state.shut_down {
                return;
            }
            state.loop_running = true;
        }
        tokio::spawn(Arc::clone(this).drain());
    }

    async fn drain(self: Arc<Self>) {
        loop {
            if let Some(remaining) = self.bridge.rate_limit().remaining() {
                let wait = remaining.min(self.config.max_backoff_check);
                debug!(
                    remaining = fmt_duration(remaining),
                    recheck_in = fmt_duration(wait),
                    "Rate limited, holding queue"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            match self.next_step() {
                Step::Stop => return,
                Step::Wait(delay) => tokio::time::sleep(delay).await,
                Step::Dispatch(key) => {
                    let span = tracing::debug_span!("dispatch", key = %key);
                    tokio::spawn(Arc::clone(&self).dispatch(key).instrument(span));
                }
            }
        }
    }

    fn next_step(&self) -> Step {
        let mut state = locked(&self.state);

        if state.shut_down
            || state.queue.is_empty()
            || state.in_flight >= self.config.max_concurrent
        {
            // Settling requests kick the loop again.
            state.loop_running = false;
            return Step::Stop;
        }

        if let Some(last) = state.last_dispatch {
            let since = last.elapsed();
            if since < self.config.min_interval {
                return Step::Wait(self.config.min_interval - since);
            }
        }

        let Some(key) = state.queue.pop_front() else {
            state.loop_running = false;
            return Step::Stop;
        };
        if let Some(request) = state.pending.get_mut(&key) {
            request.mark_in_flight();
        }
        state.in_flight += 1;
        state.dispatched += 1;
        state.last_dispatch = Some(Instant::now());
        debug!(
            key = %key,
            in_flight = state.in_flight,
            queued = state.queue.len(),
            "Dispatching"
        );
        Step::Dispatch(key)
    }

    async fn dispatch(self: Arc<Self>, key: String) {
        let settlement = match self.bridge.fetch(&key).await {
            Ok(Some(FetchOutcome {
                resolution,
                rate_limited: false,
            })) => {
                self.cache.record(&key, &resolution);
                Ok(Some(resolution))
            }
            Ok(Some(FetchOutcome {
                resolution,
                rate_limited: true,
            })) => {
                debug!("Throttled response, not caching");
                let partial = resolution.has_location() || resolution.full_result.is_some();
                Ok(partial.then_some(resolution))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(error = %e, "Lookup failed");
                Err(ResolveError::Fetch {
                    key: key.clone(),
                    source: Arc::new(e),
                })
            }
        };

        let request = {
            let mut state = locked(&self.state);
            state.in_flight = state.in_flight.saturating_sub(1);
            state.pending.remove(&key)
        };
        if let Some(request) = request {
            trace!(waiters = request.audience(), "Settling");
            request.settle(settlement);
        }

        tokio::time::sleep(self.config.drain_cooldown).await;
        Inner::kick(&self);
    }
}
