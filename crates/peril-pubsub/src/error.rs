//! Error types for the pub/sub layer.

use peril_broker::BrokerError;
use peril_codec::CodecError;

/// Errors that can occur while setting up subscriptions, publishing, or
/// running a subscription worker.
///
/// Malformed payloads never show up here: the worker discards them and
/// moves on. Handler verdicts aren't errors either.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// Opening a channel, declaring, binding, setting prefetch or starting
    /// the consumer failed. Returned synchronously from setup calls and
    /// never retried.
    #[error("broker setup failed: {0}")]
    Connection(#[source] BrokerError),

    /// The broker rejected a publish. Returned verbatim, not retried.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Encoding a value failed; the broker was not contacted.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An ack or nack call failed. The subscription stopped because the
    /// broker's view of the delivery is now unknown.
    #[error("acknowledgement failed on queue {queue}: {source}")]
    AckProtocol {
        /// Queue the failing subscription consumed from.
        queue: String,
        /// The broker error reported by the ack/nack call.
        #[source]
        source: BrokerError,
    },

    /// The handler panicked, or the worker task was aborted.
    #[error("subscription worker for queue {queue} aborted: {reason}")]
    WorkerAborted {
        /// Queue the worker consumed from.
        queue: String,
        /// Panic message or join error description.
        reason: String,
    },

    /// Configuration could not be loaded (e.g. an unparseable
    /// `PERIL_PREFETCH`).
    #[error("invalid configuration: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl PubSubError {
    /// Returns `true` for failures that ended a running subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AckProtocol { .. } | Self::WorkerAborted { .. })
    }
}
