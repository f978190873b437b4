//! The peer context: the only place that talks to the remote endpoint.
//!
//! Runs as its own task, receives `fetchLocation` requests over a channel and
//! answers each with a `locationResponse`. Throttling is reported with a
//! separate `rateLimitInfo` message sent ahead of the affected response.

pub mod graphql;

use crate::bridge::messages::{BridgeRequest, LocationResponse, PeerMessage};
use crate::utils::unix_seconds;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// Capacity of each direction of the peer channel.
const CHANNEL_CAPACITY: usize = 64;

/// What a source found for one screen name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceReply {
    pub location: Option<String>,
    pub location_accurate: Option<bool>,
    pub full_result: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("remote endpoint is rate limiting until {reset_at}")]
    RateLimited {
        /// Unix seconds.
        reset_at: i64,
    },
    #[error("remote endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request to remote endpoint failed")]
    Request(#[from] reqwest::Error),
    #[error("failed to parse remote response")]
    Parse(#[source] anyhow::Error),
}

/// Performs the actual remote lookup.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn lookup(&self, screen_name: &str) -> Result<SourceReply, SourceError>;
}

/// Channel ends connecting a bridge to a running peer.
pub struct PeerHandle {
    pub requests: mpsc::Sender<BridgeRequest>,
    pub messages: mpsc::Receiver<PeerMessage>,
    pub guard: PeerGuard,
}

/// Owns the peer task's lifetime.
pub struct PeerGuard {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl PeerGuard {
    /// Tear the peer down. Lookups in progress are dropped unanswered.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a peer task serving lookups from `source`.
///
/// Each request is served on its own task, so the peer imposes no
/// concurrency limit of its own.
pub fn spawn_peer(source: Arc<dyn LocationSource>) -> PeerHandle {
    let (req_tx, req_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (msg_tx, msg_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run(source, req_rx, msg_tx, cancel.clone()));

    PeerHandle {
        requests: req_tx,
        messages: msg_rx,
        guard: PeerGuard { task, cancel },
    }
}

async fn run(
    source: Arc<dyn LocationSource>,
    mut requests: mpsc::Receiver<BridgeRequest>,
    messages: mpsc::Sender<PeerMessage>,
    cancel: CancellationToken,
) {
    info!("Peer context started");
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => request,
        };
        let Some(BridgeRequest::FetchLocation {
            screen_name,
            request_id,
        }) = request
        else {
            break;
        };

        let span = tracing::debug_span!("peer_lookup", screen_name = %screen_name);
        let source = source.clone();
        let messages = messages.clone();
        let cancel = cancel.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = serve(source.as_ref(), &messages, screen_name, request_id) => {}
                }
            }
            .instrument(span),
        );
    }
    info!("Peer context stopped");
}

async fn serve(
    source: &dyn LocationSource,
    messages: &mpsc::Sender<PeerMessage>,
    screen_name: String,
    request_id: String,
) {
    let mut response = LocationResponse::empty(&screen_name, request_id);

    match source.lookup(&screen_name).await {
        Ok(reply) => {
            debug!(found = reply.location.is_some(), "Lookup completed");
            response.location = reply.location;
            response.location_accurate = reply.location_accurate;
            response.full_result = reply.full_result;
        }
        Err(SourceError::RateLimited { reset_at }) => {
            let wait_secs = u64::try_from(reset_at.saturating_sub(unix_seconds())).unwrap_or(0);
            let notice = PeerMessage::RateLimitInfo {
                reset_time: reset_at,
                wait_time: wait_secs.saturating_mul(1000),
            };
            if messages.send(notice).await.is_err() {
                return;
            }
            response.is_rate_limited = true;
        }
        Err(e) => {
            warn!(error = ?e, "Lookup failed");
            response.error = Some(format!("{e:#}"));
        }
    }

    // The bridge may already be gone during teardown.
    let _ = messages.send(PeerMessage::LocationResponse(response)).await;
}
