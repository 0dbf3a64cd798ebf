//! Unified error type for Peril.

use peril_broker::BrokerError;
use peril_codec::CodecError;
use peril_pubsub::PubSubError;

/// Top-level error that wraps all crate-specific errors.
///
/// Binaries deal with this single type instead of importing errors from
/// each layer; `?` converts layer errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum PerilError {
    /// Encoding or decoding a payload failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Talking to the broker failed outside a subscription (e.g. dialing).
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Setting up, publishing on, or running a subscription failed.
    #[error(transparent)]
    PubSub(#[from] PubSubError),
}
