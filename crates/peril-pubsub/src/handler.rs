//! Handler verdicts and the handler trait.

use peril_broker::Disposition;

/// What a handler decided about a delivery.
///
/// Every delivery ends in exactly one verdict, which the consumer engine
/// turns into exactly one broker acknowledgement call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Processed; remove it from the queue.
    Ack,
    /// Not processed now; put it back for redelivery.
    NackRequeue,
    /// Unprocessable; drop it (or dead-letter it if the queue has a DLX).
    NackDiscard,
}

impl AckType {
    /// The broker call this verdict maps to.
    pub fn disposition(self) -> Disposition {
        match self {
            Self::Ack => Disposition::Ack,
            Self::NackRequeue => Disposition::Nack { requeue: true },
            Self::NackDiscard => Disposition::Nack { requeue: false },
        }
    }
}

impl std::fmt::Display for AckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::NackRequeue => write!(f, "nack-requeue"),
            Self::NackDiscard => write!(f, "nack-discard"),
        }
    }
}

/// Application logic run for every decoded delivery.
///
/// Called from the subscription's worker task, one delivery at a time, so
/// implementations can hold mutable state without locking. A slow handler
/// only stalls its own subscription.
///
/// Any `FnMut(T) -> AckType + Send + 'static` closure is a handler.
pub trait Handler<T>: Send + 'static {
    /// Processes one value and returns the verdict.
    fn handle(&mut self, value: T) -> AckType;
}

impl<T, F> Handler<T> for F
where
    F: FnMut(T) -> AckType + Send + 'static,
{
    fn handle(&mut self, value: T) -> AckType {
        self(value)
    }
}
