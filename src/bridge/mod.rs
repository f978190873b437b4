//! Request/response correlation with the peer context.
//!
//! The coordinator never talks to the network itself. Each lookup is sent to
//! the peer as a `fetchLocation` message tagged with a fresh request id; a
//! single long-lived listener task demultiplexes the peer's replies by that id
//! and completes the matching waiting call. The same listener handles the
//! peer's unsolicited `rateLimitInfo` notices.

pub mod messages;
pub mod rate_limit;

use crate::cache::Resolution;
use crate::utils::{fmt_duration, log_if_slow};
use dashmap::DashMap;
use messages::{BridgeRequest, LocationResponse, PeerMessage};
use rate_limit::RateLimitState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Fetches slower than this are logged.
const SLOW_FETCH_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("peer context is not accepting requests")]
    PeerDisconnected,
    #[error("bridge shut down while waiting for a response")]
    Closed,
    #[error("peer lookup failed: {0}")]
    Remote(String),
}

/// A settled, non-timed-out fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub resolution: Resolution,
    /// The remote endpoint throttled this lookup. Not to be cached.
    pub rate_limited: bool,
}

impl From<LocationResponse> for FetchOutcome {
    fn from(response: LocationResponse) -> Self {
        Self {
            resolution: Resolution {
                location: response.location,
                location_accurate: response.location_accurate,
                full_result: response.full_result.map(Arc::new),
            },
            rate_limited: response.is_rate_limited,
        }
    }
}

struct Waiting {
    screen_name: String,
    reply: oneshot::Sender<LocationResponse>,
}

pub struct FetchBridge {
    outbound: mpsc::Sender<BridgeRequest>,
    /// Taken by the listener on first setup.
    inbound: Mutex<Option<mpsc::Receiver<PeerMessage>>>,
    /// request id → caller awaiting that response
    waiting: Arc<DashMap<String, Waiting>>,
    rate_limit: Arc<RateLimitState>,
    timeout: Duration,
    listener_started: AtomicBool,
    rate_limit_notices: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl FetchBridge {
    pub fn new(
        outbound: mpsc::Sender<BridgeRequest>,
        inbound: mpsc::Receiver<PeerMessage>,
        rate_limit: Arc<RateLimitState>,
        timeout: Duration,
    ) -> Self {
        Self {
            outbound,
            inbound: Mutex::new(Some(inbound)),
            waiting: Arc::new(DashMap::new()),
            rate_limit,
            timeout,
            listener_started: AtomicBool::new(false),
            rate_limit_notices: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn rate_limit(&self) -> &Arc<RateLimitState> {
        &self.rate_limit
    }

    /// Number of `rateLimitInfo` notices processed so far.
    pub fn rate_limit_notices(&self) -> u64 {
        self.rate_limit_notices.load(Ordering::Relaxed)
    }

    /// Calls currently awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.waiting.len()
    }

    /// Start the listener task. Safe to call any number of times; only the
    /// first call has an effect.
    pub fn setup(&self) {
        if self
            .listener_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Bridge listener already running");
            return;
        }

        let Some(inbound) = crate::utils::locked(&self.inbound).take() else {
            return;
        };

        let listener = Listener {
            waiting: self.waiting.clone(),
            rate_limit: self.rate_limit.clone(),
            notices: self.rate_limit_notices.clone(),
        };
        tokio::spawn(listener.run(inbound, self.cancel.clone()));
        debug!("Bridge listener started");
    }

    /// Perform one remote lookup for `screen_name` through the peer.
    ///
    /// Resolves to `Ok(None)` when the peer does not answer within the
    /// timeout; that is an ordinary "unknown, retry later" outcome.
    pub async fn fetch(&self, screen_name: &str) -> Result<Option<FetchOutcome>, BridgeError> {
        self.setup();
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Closed);
        }

        let request_id = ulid::Ulid::new().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(
            request_id.clone(),
            Waiting {
                screen_name: screen_name.to_owned(),
                reply: tx,
            },
        );

        let start = Instant::now();
        let request = BridgeRequest::FetchLocation {
            screen_name: screen_name.to_owned(),
            request_id: request_id.clone(),
        };
        if self.outbound.send(request).await.is_err() {
            self.waiting.remove(&request_id);
            return Err(BridgeError::PeerDisconnected);
        }
        trace!(screen_name, request_id = %request_id, "Fetch sent to peer");

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(BridgeError::Closed),
            Err(_elapsed) => {
                self.waiting.remove(&request_id);
                debug!(
                    screen_name,
                    request_id = %request_id,
                    timeout = fmt_duration(self.timeout),
                    "Fetch timed out"
                );
                return Ok(None);
            }
        };
        log_if_slow(start, SLOW_FETCH_THRESHOLD, "peer fetch");

        if let Some(error) = response.error {
            return Err(BridgeError::Remote(error));
        }
        Ok(Some(response.into()))
    }

    /// Stop the listener and abandon every outstanding call.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let abandoned = self.waiting.len();
        self.waiting.clear();
        if abandoned > 0 {
            debug!(abandoned, "Abandoned outstanding fetches on shutdown");
        }
    }
}

impl Drop for FetchBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The single consumer of peer messages.
struct Listener {
    waiting: Arc<DashMap<String, Waiting>>,
    rate_limit: Arc<RateLimitState>,
    notices: Arc<AtomicU64>,
}

impl Listener {
    async fn run(self, mut inbound: mpsc::Receiver<PeerMessage>, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv() => message,
            };

            match message {
                Some(message) => self.handle(message),
                None => {
                    warn!(
                        outstanding = self.waiting.len(),
                        "Peer context closed its channel"
                    );
                    // Dropping the senders fails every waiting call.
                    self.waiting.clear();
                    break;
                }
            }
        }
        debug!("Bridge listener stopped");
    }

    fn handle(&self, message: PeerMessage) {
        match message {
            PeerMessage::LocationResponse(response) => {
                let matches = self
                    .waiting
                    .get(&response.request_id)
                    .is_some_and(|w| w.screen_name == response.screen_name);
                if !matches {
                    // Late reply to a timed-out call, or a misrouted one.
                    trace!(
                        screen_name = %response.screen_name,
                        request_id = %response.request_id,
                        "Dropping uncorrelated response"
                    );
                    return;
                }

                if let Some((_, waiting)) = self.waiting.remove(&response.request_id) {
                    let _ = waiting.reply.send(response);
                }
            }
            PeerMessage::RateLimitInfo {
                reset_time,
                wait_time,
            } => {
                self.notices.fetch_add(1, Ordering::Relaxed);
                self.rate_limit
                    .record(reset_time, Duration::from_millis(wait_time));
            }
        }
    }
}
