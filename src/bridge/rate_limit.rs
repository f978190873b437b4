//! Process-wide backoff state set when the remote endpoint throttles us.

use crate::utils::{fmt_duration, locked, unix_millis};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Longest backoff honored from a single notice.
const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct Backoff {
    /// As reported by the remote, Unix seconds.
    reset_at: i64,
    /// `reset_at` translated onto the monotonic clock when it was recorded.
    deadline: Instant,
}

/// Written by the bridge's listener, read by the coordinator's loop.
#[derive(Debug, Default)]
pub struct RateLimitState {
    backoff: Mutex<Option<Backoff>>,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a throttling notice. Returns how long dispatching is paused.
    ///
    /// A reset time already in the past is ignored. An earlier reset never
    /// shortens a backoff that is already in effect. Pauses are capped at one
    /// day.
    pub fn record(&self, reset_at: i64, wait_hint: Duration) -> Duration {
        let until_reset_ms = reset_at.saturating_mul(1000).saturating_sub(unix_millis());
        if until_reset_ms <= 0 {
            debug!(reset_at, "Ignoring rate limit notice with elapsed reset time");
            return Duration::ZERO;
        }

        let remaining = Duration::from_millis(until_reset_ms.unsigned_abs()).min(MAX_BACKOFF);
        let deadline = Instant::now() + remaining;

        let mut backoff = locked(&self.backoff);
        match *backoff {
            Some(current) if current.deadline >= deadline => {}
            _ => *backoff = Some(Backoff { reset_at, deadline }),
        }

        warn!(
            reset_at,
            remaining = fmt_duration(remaining),
            wait_hint = fmt_duration(wait_hint),
            "Rate limit detected, pausing dispatch"
        );
        remaining
    }

    /// Time left until dispatching may resume, or `None` if not limited.
    ///
    /// Clears the state once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        let mut backoff = locked(&self.backoff);
        let current = (*backoff)?;
        let now = Instant::now();
        if now >= current.deadline {
            *backoff = None;
            debug!(reset_at = current.reset_at, "Rate limit window elapsed");
            return None;
        }
        Some(current.deadline - now)
    }

    pub fn is_limited(&self) -> bool {
        self.remaining().is_some()
    }

    /// Reported reset time of the active backoff, Unix seconds.
    pub fn reset_at(&self) -> Option<i64> {
        self.remaining()?;
        locked(&self.backoff).map(|b| b.reset_at)
    }

    pub fn clear(&self) {
        locked(&self.backoff).take();
    }
}
