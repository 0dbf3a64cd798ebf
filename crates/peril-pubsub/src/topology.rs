//! Queue classes, bindings and the topology manager.
//!
//! The topology manager opens one channel per binding, declares the queue
//! with flags derived from its [`QueueClass`], and binds it to an exchange.
//! Redeclaring the same binding converges on the same broker topology.

use peril_broker::{
    BrokerChannel, BrokerConnection, BrokerError, ExchangeKind, QueueInfo, QueueOptions,
};
use tracing::{debug, info};

use crate::{PubSubConfig, PubSubError};

// ---------------------------------------------------------------------------
// QueueClass
// ---------------------------------------------------------------------------

/// Lifetime class of a queue.
///
/// The broker flags are derived from the class and never set independently:
///
/// | Class       | durable | exclusive | auto-delete |
/// |-------------|---------|-----------|-------------|
/// | `Durable`   | true    | false     | false       |
/// | `Transient` | false   | true      | true        |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClass {
    /// Survives broker restarts, shareable, kept when unused.
    Durable,
    /// Lives only as long as the declaring connection.
    Transient,
}

impl QueueClass {
    /// Whether the queue survives a broker restart.
    pub fn durable(self) -> bool {
        matches!(self, Self::Durable)
    }

    /// Whether the queue is private to the declaring connection.
    pub fn exclusive(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Whether the broker deletes the queue once it is no longer used.
    pub fn auto_delete(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Declaration options for this class, with an optional dead-letter
    /// exchange argument.
    pub fn queue_options(self, dead_letter_exchange: Option<&str>) -> QueueOptions {
        QueueOptions {
            durable: self.durable(),
            exclusive: self.exclusive(),
            auto_delete: self.auto_delete(),
            dead_letter_exchange: dead_letter_exchange.map(str::to_string),
        }
    }
}

impl std::fmt::Display for QueueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Durable => write!(f, "durable"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// A queue bound to an exchange under a routing key.
///
/// Built once per subscription. Redeclaring the same binding (e.g. after a
/// reconnect) is safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Exchange the queue is bound to.
    pub exchange: String,
    /// Queue name. Empty lets the broker generate one.
    pub queue: String,
    /// Binding key (exact for direct exchanges, pattern for topic ones).
    pub routing_key: String,
    /// Lifetime class of the queue.
    pub class: QueueClass,
    /// Overrides [`PubSubConfig::dead_letter_enabled`] for this queue.
    pub dead_letter: Option<bool>,
}

impl Binding {
    /// Creates a binding that follows the configured dead-letter setting.
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        class: QueueClass,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            class,
            dead_letter: None,
        }
    }

    /// Forces dead lettering on or off for this queue.
    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = Some(enabled);
        self
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Declares exchanges and queues and binds them.
#[derive(Debug, Clone)]
pub struct Topology {
    config: PubSubConfig,
}

impl Topology {
    /// Creates a topology manager from config.
    pub fn new(config: PubSubConfig) -> Self {
        Self {
            config: config.validated(),
        }
    }

    /// The config this manager was built with.
    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Declaration options for `binding`, dead-letter argument included.
    pub fn queue_options(&self, binding: &Binding) -> QueueOptions {
        binding
            .class
            .queue_options(self.config.dead_letter_target(binding.dead_letter))
    }

    /// Opens a fresh channel, declares the binding's queue and binds it.
    ///
    /// The channel is returned for the caller to own. If declaring or
    /// binding fails, the channel is closed here and only the error is
    /// returned.
    pub async fn declare_and_bind<C: BrokerConnection>(
        &self,
        connection: &C,
        binding: &Binding,
    ) -> Result<(C::Channel, QueueInfo), PubSubError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(PubSubError::Connection)?;

        match self.declare_on(&channel, binding).await {
            Ok(queue) => {
                info!(
                    exchange = %binding.exchange,
                    queue = %queue.name,
                    routing_key = %binding.routing_key,
                    class = %binding.class,
                    channel = %channel.id(),
                    "queue declared and bound"
                );
                Ok((channel, queue))
            }
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "closing channel after failed declaration");
                }
                Err(PubSubError::Connection(e))
            }
        }
    }

    async fn declare_on<Ch: BrokerChannel>(
        &self,
        channel: &Ch,
        binding: &Binding,
    ) -> Result<QueueInfo, BrokerError> {
        let queue = channel
            .declare_queue(&binding.queue, &self.queue_options(binding))
            .await?;
        // Bind by the declared name so broker-named queues work too.
        channel
            .bind_queue(&queue.name, &binding.exchange, &binding.routing_key)
            .await?;
        Ok(queue)
    }

    /// Declares a durable exchange on a short-lived channel.
    pub async fn declare_exchange<C: BrokerConnection>(
        &self,
        connection: &C,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), PubSubError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(PubSubError::Connection)?;
        let declared = channel.declare_exchange(name, kind, true).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "closing exchange declaration channel");
        }
        declared.map_err(PubSubError::Connection)?;
        debug!(exchange = name, %kind, "exchange declared");
        Ok(())
    }

    /// Declares the dead-letter fanout exchange and a durable queue bound to
    /// it, so discarded messages are kept for inspection.
    pub async fn declare_dead_letter_route<C: BrokerConnection>(
        &self,
        connection: &C,
    ) -> Result<QueueInfo, PubSubError> {
        self.declare_exchange(
            connection,
            &self.config.dead_letter_exchange,
            ExchangeKind::Fanout,
        )
        .await?;

        let binding = Binding::new(
            self.config.dead_letter_exchange.clone(),
            self.config.dead_letter_queue.clone(),
            "",
            QueueClass::Durable,
        )
        .with_dead_letter(false);
        let (channel, queue) = self.declare_and_bind(connection, &binding).await?;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "closing dead-letter declaration channel");
        }
        Ok(queue)
    }
}
