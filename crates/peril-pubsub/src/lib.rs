//! Typed publish/subscribe over a message broker for Peril.
//!
//! Sits between the game and the broker: it declares queues with a fixed
//! lifetime policy, publishes typed values, and runs one worker task per
//! subscription that decodes deliveries, calls application code and turns
//! its verdict into exactly one acknowledgement.
//!
//! # Key types
//!
//! - [`Topology`] — declares exchanges and queues, binds them
//! - [`publish`] / [`Publisher`] — encode and publish typed values
//! - [`ConsumerEngine`] — starts subscriptions
//! - [`SubscriptionHandle`] — observe, cancel or join a running subscription
//! - [`Handler`] / [`AckType`] — application logic and its verdict
//! - [`PubSubConfig`] — broker address, dead lettering, prefetch

mod config;
mod consumer;
mod error;
mod handler;
mod publisher;
mod subscription;
mod topology;

pub use self::config::{ENV_AMQP_URI, ENV_DEAD_LETTER_EXCHANGE, ENV_PREFETCH, ENV_PREFIX, PubSubConfig};
pub use consumer::ConsumerEngine;
pub use error::PubSubError;
pub use handler::{AckType, Handler};
pub use publisher::{Publisher, publish};
pub use subscription::{SubscriptionEnd, SubscriptionHandle, SubscriptionState};
pub use topology::{Binding, QueueClass, Topology};
