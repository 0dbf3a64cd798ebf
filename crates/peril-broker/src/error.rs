/// Boxed source error carried by [`BrokerError`] variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur talking to the broker.
///
/// Variants name the operation that failed; the source is whatever the
/// adapter (lapin, the in-memory broker) reported.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Opening a channel failed, or the channel/connection is unusable.
    #[error("channel unavailable: {0}")]
    Channel(#[source] BoxError),

    /// Declaring an exchange failed.
    #[error("exchange declaration failed: {0}")]
    ExchangeDeclare(#[source] BoxError),

    /// Declaring a queue failed (e.g. flags conflict with an existing queue).
    #[error("queue declaration failed: {0}")]
    QueueDeclare(#[source] BoxError),

    /// Binding a queue to an exchange failed.
    #[error("queue binding failed: {0}")]
    Bind(#[source] BoxError),

    /// Setting the prefetch limit failed.
    #[error("qos failed: {0}")]
    Qos(#[source] BoxError),

    /// Opening a delivery stream failed.
    #[error("consume failed: {0}")]
    Consume(#[source] BoxError),

    /// Publishing a message failed.
    #[error("publish failed: {0}")]
    Publish(#[source] BoxError),

    /// An ack or nack call failed. The broker's view of the delivery is
    /// unknown after this.
    #[error("acknowledgement failed: {0}")]
    Acknowledge(#[source] BoxError),

    /// The channel or connection was closed.
    #[error("closed: {0}")]
    Closed(String),
}
