use super::{ResolveError, Settlement};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingState {
    /// Waiting in the work queue.
    Queued,
    /// Handed to the bridge.
    InFlight,
}

/// One in-flight resolution and everyone waiting on it.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    key: String,
    state: PendingState,
    primary: oneshot::Sender<Settlement>,
    /// Callers that arrived while this request was already pending.
    waiters: Vec<oneshot::Sender<Settlement>>,
}

impl PendingRequest {
    pub(crate) fn new(key: impl Into<String>) -> (Self, oneshot::Receiver<Settlement>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            key: key.into(),
            state: PendingState::Queued,
            primary: tx,
            waiters: Vec::new(),
        };
        (request, rx)
    }

    /// Register another caller for the same outcome.
    pub(crate) fn attach(&mut self) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    pub(crate) fn state(&self) -> PendingState {
        self.state
    }

    pub(crate) fn mark_in_flight(&mut self) {
        self.state = PendingState::InFlight;
    }

    /// Number of callers that will observe the settlement.
    pub(crate) fn audience(&self) -> usize {
        1 + self.waiters.len()
    }

    /// Deliver `outcome` to the primary caller and every waiter.
    pub(crate) fn settle(self, outcome: Settlement) {
        for waiter in self.waiters {
            // Receivers dropped by callers that gave up are fine to skip.
            let _ = waiter.send(outcome.clone());
        }
        let _ = self.primary.send(outcome);
    }

    /// Settle as abandoned.
    pub(crate) fn abandon(self) {
        let key = self.key.clone();
        self.settle(Err(ResolveError::Shutdown { key }));
    }
}
