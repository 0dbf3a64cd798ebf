//! Broker abstraction layer for Peril.
//!
//! Provides the [`BrokerConnection`], [`BrokerChannel`], [`DeliveryStream`]
//! and [`Delivery`] traits that the pub/sub engine is written against, so
//! the same engine runs over RabbitMQ in production and over an in-process
//! broker in tests.
//!
//! # Architecture
//!
//! The traits mirror the AMQP 0-9-1 object model one level at a time:
//!
//! ```text
//! BrokerConnection ──create_channel──▶ BrokerChannel ──consume──▶ DeliveryStream
//!   (shared, Sync)                      (one owner)                  │
//!                                                                    ▼
//!                                          settle(Disposition) ◀── Delivery
//! ```
//!
//! A connection is cheap to share and may serve many channels. A channel is
//! the unit of failure: when the broker rejects an operation (a conflicting
//! redeclaration, a bind to a missing exchange) the channel is unusable
//! afterwards, so callers close it and open a new one. Deliveries are scoped
//! to the channel that consumed them and can only be settled there.
//!
//! # Feature Flags
//!
//! - `amqp` (default) — AMQP 0-9-1 adapter via `lapin`
//! - `memory` (default) — in-process broker with exchange routing, manual
//!   acknowledgement, prefetch, requeue and dead lettering

#[cfg(feature = "amqp")]
mod amqp;
mod error;
#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpConnection, AmqpDeliveries, AmqpDelivery};
pub use error::{BoxError, BrokerError};
#[cfg(feature = "memory")]
pub use memory::{
    MemoryBroker, MemoryChannel, MemoryConnection, MemoryDeliveries, MemoryDelivery,
};

use std::fmt;
use std::future::Future;

/// Opaque identifier for a broker channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Creates a new `ChannelId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Routing behavior of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes to queues whose binding key equals the routing key.
    Direct,
    /// Routes by dot-separated pattern (`*` one word, `#` zero or more).
    Topic,
    /// Routes to every bound queue, ignoring the routing key.
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Topic => write!(f, "topic"),
            Self::Fanout => write!(f, "fanout"),
        }
    }
}

/// Flags and arguments for a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Usable only by the declaring connection.
    pub exclusive: bool,
    /// Deleted when its last consumer / owning connection goes away.
    pub auto_delete: bool,
    /// Exchange that rejected messages are re-routed to
    /// (`x-dead-letter-exchange`).
    pub dead_letter_exchange: Option<String>,
}

/// What the broker reported back for a declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Queue name (broker-generated when declared with an empty name).
    pub name: String,
    /// Ready messages at declaration time.
    pub message_count: u32,
    /// Active consumers at declaration time.
    pub consumer_count: u32,
}

/// A message about to be published.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    /// Encoded body.
    pub payload: &'a [u8],
    /// MIME type of the body.
    pub content_type: &'a str,
    /// Delivery mode 2 when `true`, 1 otherwise.
    pub persistent: bool,
}

/// The broker-side action that settles a delivery.
///
/// | Disposition                  | Message afterwards                              |
/// |------------------------------|-------------------------------------------------|
/// | `Ack`                        | removed from the queue                          |
/// | `Nack { requeue: true }`     | back at the head of its queue, `redelivered` set |
/// | `Nack { requeue: false }`    | dead-lettered if the queue has a dead-letter exchange, otherwise dropped |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge this delivery only (never cumulative).
    Ack,
    /// Reject this delivery only, optionally asking for redelivery.
    Nack {
        /// Return the message to the queue instead of dropping or
        /// dead-lettering it.
        requeue: bool,
    },
}

/// An open broker connection that hands out channels.
///
/// The connection may be shared between subscriptions; channels are not.
pub trait BrokerConnection: Send + Sync + 'static {
    /// The channel type produced by this connection.
    type Channel: BrokerChannel;

    /// Opens a fresh logical channel.
    fn create_channel(&self) -> impl Future<Output = Result<Self::Channel, BrokerError>> + Send;
}

/// A logical channel on a broker connection.
///
/// ## Ownership
///
/// Each channel has a single owner: the pub/sub engine opens one per
/// subscription and never shares it, so acknowledgements from different
/// subscriptions can't interleave. The `Sync` bound only lets the owner hold
/// it across `.await` points in a spawned task.
///
/// ## Failure
///
/// Any error from a declaration or bind leaves the channel closed on a real
/// broker. Callers should call [`close`](Self::close) (ignoring its error)
/// and open a fresh channel rather than retry on the same one.
///
/// ## Example
///
/// ```rust
/// use peril_broker::{BrokerChannel, BrokerConnection, BrokerError, MemoryBroker, QueueOptions};
///
/// # async fn demo() -> Result<(), BrokerError> {
/// let broker = MemoryBroker::new();
/// let channel = broker.connect().create_channel().await?;
/// let queue = channel.declare_queue("war", &QueueOptions::default()).await?;
/// channel.bind_queue(&queue.name, "amq.topic", "war.*").await?;
/// channel.close().await?;
/// # Ok(())
/// # }
/// ```
pub trait BrokerChannel: Send + Sync + 'static {
    /// The delivery stream returned by [`consume`](Self::consume).
    type Deliveries: DeliveryStream;

    /// Returns the identifier of this channel.
    fn id(&self) -> ChannelId;

    /// Declares an exchange. Redeclaring with identical settings is a no-op.
    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Declares a queue. Redeclaring with identical options is a no-op.
    fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> impl Future<Output = Result<QueueInfo, BrokerError>> + Send;

    /// Binds `queue` to `exchange` under `routing_key`.
    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Limits the number of unacknowledged deliveries pushed to a consumer.
    fn set_prefetch(&self, count: u16) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Starts a manual-acknowledgement consumer on `queue`.
    ///
    /// An empty `consumer_tag` lets the broker pick one.
    fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> impl Future<Output = Result<Self::Deliveries, BrokerError>> + Send;

    /// Publishes a non-mandatory, non-immediate message.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage<'_>,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Closes the channel. Unacknowledged deliveries return to their queues.
    fn close(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// A stream of deliveries from one consumer.
///
/// At most `prefetch` deliveries are outstanding at once; the stream
/// parks until one of them is settled or a new message arrives.
pub trait DeliveryStream: Send + 'static {
    /// The delivery type yielded by this stream.
    type Delivery: Delivery;

    /// Waits for the next delivery.
    ///
    /// Returns `None` once the stream is closed (channel or connection
    /// closed, consumer cancelled).
    fn next_delivery(
        &mut self,
    ) -> impl Future<Output = Option<Result<Self::Delivery, BrokerError>>> + Send;
}

/// One message handed to a consumer, pending acknowledgement.
///
/// `ack` and `nack` consume the delivery: once settled it no longer exists
/// from the consumer's point of view, and the type system rules out settling
/// it twice.
///
/// ## Delivery tags
///
/// The broker numbers deliveries per channel. A tag means nothing on another
/// channel, and after its channel closes the broker has already requeued the
/// message, so settling then fails with [`BrokerError::Channel`].
pub trait Delivery: Send + 'static {
    /// Message body.
    fn payload(&self) -> &[u8];

    /// Content type the publisher tagged the message with.
    fn content_type(&self) -> Option<&str>;

    /// `true` if the broker has delivered this message before.
    fn redelivered(&self) -> bool;

    /// Channel-scoped delivery tag.
    fn delivery_tag(&self) -> u64;

    /// Acknowledges this delivery only.
    fn ack(self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Rejects this delivery only.
    fn nack(self, requeue: bool) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Settles this delivery with the given disposition.
    fn settle(
        self,
        disposition: Disposition,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send
    where
        Self: Sized,
    {
        async move {
            match disposition {
                Disposition::Ack => self.ack().await,
                Disposition::Nack { requeue } => self.nack(requeue).await,
            }
        }
    }
}
