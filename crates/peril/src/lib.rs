//! # Peril
//!
//! Message-broker plumbing for the Peril strategy game.
//!
//! Game processes talk to each other only through a broker: the server
//! publishes pause/resume state on a direct exchange, clients subscribe with
//! connection-scoped queues, and game logs flow through a topic exchange.
//! This crate bundles the codec, broker and pub/sub layers behind one error
//! type and holds the game's exchange names and message types.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peril::prelude::*;
//!
//! # async fn run() -> Result<(), PerilError> {
//! let config = PubSubConfig::from_env()?;
//! let conn = AmqpConnection::connect(&config.amqp_uri).await?;
//!
//! let engine = ConsumerEngine::new(config);
//! let binding = Binding::new(
//!     routing::EXCHANGE_PERIL_DIRECT,
//!     routing::pause_queue("lincoln"),
//!     routing::PAUSE_KEY,
//!     QueueClass::Transient,
//! );
//! let handle = engine
//!     .subscribe(&conn, binding, JsonCodec, |state: PlayingState| {
//!         println!("paused: {}", state.is_paused);
//!         AckType::Ack
//!     })
//!     .await?;
//! handle.join().await?;
//! # Ok(())
//! # }
//! ```

mod error;
pub mod logging;
pub mod routing;

pub use error::PerilError;

pub use peril_broker as broker;
pub use peril_codec as codec;
pub use peril_pubsub as pubsub;

/// Common imports for Peril processes.
pub mod prelude {
    pub use crate::PerilError;
    pub use crate::routing::{self, GameLog, PlayingState};

    pub use peril_broker::{AmqpConnection, BrokerChannel, BrokerConnection, ExchangeKind};
    pub use peril_codec::{CborCodec, Codec, JsonCodec};
    pub use peril_pubsub::{
        AckType, Binding, ConsumerEngine, Handler, PubSubConfig, Publisher, QueueClass,
        SubscriptionEnd, SubscriptionHandle, SubscriptionState, Topology, publish,
    };
}
