//! Subscription lifecycle and the handle returned by
//! [`ConsumerEngine::subscribe`](crate::ConsumerEngine::subscribe).

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::PubSubError;

// ---------------------------------------------------------------------------
// SubscriptionState
// ---------------------------------------------------------------------------

/// The lifecycle state of a subscription.
///
/// Transitions only move forward:
///
/// ```text
/// Initializing → Declaring → Consuming → Closed
///                    │            │
///                    └────────────┴──→ Failed
/// ```
///
/// - **Initializing**: subscribe was called, nothing sent to the broker yet.
/// - **Declaring**: the queue is being declared and bound, prefetch set and
///   the consumer started.
/// - **Consuming**: the worker is handling deliveries.
/// - **Closed**: the worker stopped cleanly (stream ended or cancelled).
/// - **Failed**: setup failed, or an acknowledgement call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Initializing,
    Declaring,
    Consuming,
    Closed,
    Failed,
}

impl SubscriptionState {
    /// Returns `true` once the subscription can't change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Returns `true` if transitioning to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Initializing, Self::Declaring)
                | (Self::Declaring, Self::Consuming)
                | (Self::Declaring, Self::Failed)
                | (Self::Consuming, Self::Closed)
                | (Self::Consuming, Self::Failed)
        )
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Declaring => write!(f, "Declaring"),
            Self::Consuming => write!(f, "Consuming"),
            Self::Closed => write!(f, "Closed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Moves `state` to `next`, logging transitions that break the ordering.
pub(crate) fn transition(state: &watch::Sender<SubscriptionState>, next: SubscriptionState) {
    state.send_modify(|current| {
        if !current.can_transition_to(next) {
            tracing::warn!(from = %current, to = %next, "unexpected subscription transition");
        }
        *current = next;
    });
}

/// Why a subscription worker stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The broker ended the delivery stream (channel or connection closed,
    /// consumer cancelled by the server).
    StreamClosed,
    /// [`SubscriptionHandle::cancel`] was called.
    Cancelled,
}

// ---------------------------------------------------------------------------
// SubscriptionHandle
// ---------------------------------------------------------------------------

/// Handle to a running subscription worker.
///
/// Dropping the handle detaches the worker: it keeps consuming until the
/// stream ends or an acknowledgement fails.
#[derive(Debug)]
pub struct SubscriptionHandle {
    queue: String,
    state: watch::Receiver<SubscriptionState>,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<SubscriptionEnd, PubSubError>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        queue: String,
        state: watch::Receiver<SubscriptionState>,
        cancel: oneshot::Sender<()>,
        task: JoinHandle<Result<SubscriptionEnd, PubSubError>>,
    ) -> Self {
        Self {
            queue,
            state,
            cancel: Some(cancel),
            task,
        }
    }

    /// Name of the queue being consumed (broker-generated if the binding
    /// left it empty).
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Waits until the subscription reaches `target` or a terminal state,
    /// and returns the state it stopped at.
    pub async fn wait_for(&self, target: SubscriptionState) -> SubscriptionState {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == target || s.is_terminal())
            .await
            .map(|s| *s);
        match reached {
            Ok(s) => s,
            // Worker gone; its last write is final.
            Err(_) => *state.borrow(),
        }
    }

    /// Returns `true` once the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the worker to stop.
    ///
    /// The worker closes its channel, which hands prefetched but unsettled
    /// deliveries back to the queue. Returns `false` if cancellation was
    /// already requested or the worker has exited.
    pub fn cancel(&mut self) -> bool {
        match self.cancel.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Waits for the worker to exit and returns how it ended.
    ///
    /// # Errors
    /// - [`PubSubError::AckProtocol`] if an ack or nack call failed.
    /// - [`PubSubError::WorkerAborted`] if the handler panicked.
    pub async fn join(self) -> Result<SubscriptionEnd, PubSubError> {
        let queue = self.queue;
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(PubSubError::WorkerAborted {
                queue,
                reason: e.to_string(),
            }),
        }
    }

    /// Cancels the worker and waits for it to exit.
    pub async fn shutdown(mut self) -> Result<SubscriptionEnd, PubSubError> {
        self.cancel();
        self.join().await
    }
}
