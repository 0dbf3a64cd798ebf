//! In-process broker with AMQP-like semantics.
//!
//! Supports direct, topic and fanout exchanges, the default exchange,
//! durable/exclusive/auto-delete queues, manual acknowledgement, per-channel
//! prefetch, requeue-to-front with the redelivered flag, and dead lettering
//! through `x-dead-letter-exchange`. Used by tests and demos that can't reach
//! a real RabbitMQ.
//!
//! All routing state sits behind one `std::sync::Mutex`; the lock is never
//! held across an `.await`. Consumers park on a shared [`Notify`] and
//! re-check their queue whenever anything changes.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::{
    BrokerChannel, BrokerConnection, BrokerError, ChannelId, Delivery, DeliveryStream,
    ExchangeKind, OutboundMessage, QueueInfo, QueueOptions,
};

/// Name of the nameless default exchange every queue is bound to.
const DEFAULT_EXCHANGE: &str = "";

/// Exchanges that exist on a fresh broker.
const PREDECLARED: [(&str, ExchangeKind); 3] = [
    ("amq.direct", ExchangeKind::Direct),
    ("amq.topic", ExchangeKind::Topic),
    ("amq.fanout", ExchangeKind::Fanout),
];

// ---------------------------------------------------------------------------
// Broker state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    content_type: String,
    redelivered: bool,
}

struct Unacked {
    channel: u64,
    consumer_tag: String,
    message: StoredMessage,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    /// `(queue, binding key)` pairs.
    bindings: Vec<(String, String)>,
}

struct QueueState {
    options: QueueOptions,
    /// Declaring connection, for exclusive queues.
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    /// Set once the queue has had a consumer; auto-delete only applies after.
    had_consumer: bool,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
}

struct ConsumerState {
    queue: String,
    channel: u64,
}

#[derive(Default)]
struct State {
    next_id: u64,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<String, ConsumerState>,
}

/// Outcome of polling a consumer for its next message.
enum NextDelivery {
    Ready(MemoryDelivery),
    Pending,
    Closed,
}

impl State {
    fn with_predeclared() -> Self {
        let mut state = Self::default();
        for (name, kind) in PREDECLARED {
            state.exchanges.insert(
                name.to_string(),
                ExchangeState {
                    kind,
                    durable: true,
                    bindings: Vec::new(),
                },
            );
        }
        state
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|ch| self.connections.contains(&ch.connection))
    }

    fn ensure_open(&self, channel: u64) -> Result<u64, String> {
        match self.channels.get(&channel) {
            Some(ch) if self.connections.contains(&ch.connection) => Ok(ch.connection),
            _ => Err(format!("channel ch-{channel} is closed")),
        }
    }

    /// Resolves the queues a message published to `exchange` lands in.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, String> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| format!("NOT_FOUND - no exchange '{exchange}'"))?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &state.bindings {
            let matched = match state.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => topic_matches(key, routing_key),
                ExchangeKind::Fanout => true,
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, targets: &[String], message: &StoredMessage) {
        for queue in targets {
            if let Some(q) = self.queues.get_mut(queue) {
                q.ready.push_back(message.clone());
            }
        }
    }

    fn in_flight(&self, consumer_tag: &str, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| {
            q.unacked
                .values()
                .filter(|u| u.consumer_tag == consumer_tag)
                .count()
        })
    }

    fn poll(&mut self, consumer_tag: &str, shared: &Arc<Shared>) -> NextDelivery {
        let Some(consumer) = self.consumers.get(consumer_tag) else {
            return NextDelivery::Closed;
        };
        let (queue, channel) = (consumer.queue.clone(), consumer.channel);
        if !self.channel_open(channel) {
            return NextDelivery::Closed;
        }

        let prefetch = self.channels.get(&channel).map_or(0, |ch| ch.prefetch);
        if prefetch > 0 && self.in_flight(consumer_tag, &queue) >= usize::from(prefetch) {
            return NextDelivery::Pending;
        }

        let tag = self.next_id();
        let Some(q) = self.queues.get_mut(&queue) else {
            return NextDelivery::Closed;
        };
        let Some(message) = q.ready.pop_front() else {
            return NextDelivery::Pending;
        };

        let delivery = MemoryDelivery {
            shared: Arc::clone(shared),
            queue: queue.clone(),
            delivery_tag: tag,
            payload: message.payload.clone(),
            content_type: message.content_type.clone(),
            redelivered: message.redelivered,
        };
        q.unacked.insert(
            tag,
            Unacked {
                channel,
                consumer_tag: consumer_tag.to_string(),
                message,
            },
        );
        NextDelivery::Ready(delivery)
    }

    fn settle(&mut self, queue: &str, tag: u64, requeue: Option<bool>) -> Result<(), String> {
        let channel = self
            .queues
            .get(queue)
            .ok_or_else(|| format!("queue '{queue}' no longer exists"))?
            .unacked
            .get(&tag)
            .map(|u| u.channel)
            .ok_or_else(|| format!("PRECONDITION_FAILED - unknown delivery tag {tag}"))?;
        self.ensure_open(channel)?;

        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| format!("queue '{queue}' no longer exists"))?;
        let Some(unacked) = q.unacked.remove(&tag) else {
            return Err(format!("PRECONDITION_FAILED - unknown delivery tag {tag}"));
        };

        match requeue {
            None => {}
            Some(true) => {
                let mut message = unacked.message;
                message.redelivered = true;
                q.ready.push_front(message);
            }
            Some(false) => {
                if let Some(dlx) = q.options.dead_letter_exchange.clone() {
                    self.dead_letter(&dlx, unacked.message);
                }
            }
        }
        Ok(())
    }

    /// Re-routes a rejected message through `dlx` under its original key.
    /// Dropped when the exchange doesn't exist, as RabbitMQ does.
    fn dead_letter(&mut self, dlx: &str, mut message: StoredMessage) {
        match self.route(dlx, &message.routing_key) {
            Ok(targets) => {
                tracing::debug!(
                    dlx,
                    from = %message.exchange,
                    queues = targets.len(),
                    "dead-lettering message"
                );
                message.exchange = dlx.to_string();
                message.redelivered = false;
                self.enqueue(&targets, &message);
            }
            Err(reason) => {
                tracing::debug!(dlx, %reason, "dead-letter exchange missing, dropping message");
            }
        }
    }

    /// Cancels the channel's consumers and requeues what they held.
    fn close_channel(&mut self, channel: u64) {
        if self.channels.remove(&channel).is_none() {
            return;
        }

        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.channel == channel)
            .map(|(tag, _)| tag.clone())
            .collect();
        let mut touched: HashSet<String> = HashSet::new();
        for tag in tags {
            if let Some(consumer) = self.consumers.remove(&tag) {
                touched.insert(consumer.queue);
            }
        }

        for q in self.queues.values_mut() {
            let mut returned: Vec<(u64, StoredMessage)> = q
                .unacked
                .iter()
                .filter(|(_, u)| u.channel == channel)
                .map(|(tag, u)| (*tag, u.message.clone()))
                .collect();
            // Oldest delivery ends up at the front.
            returned.sort_by_key(|(tag, _)| *tag);
            for (tag, mut message) in returned.into_iter().rev() {
                q.unacked.remove(&tag);
                message.redelivered = true;
                q.ready.push_front(message);
            }
        }

        for queue in touched {
            let no_consumers = !self.consumers.values().any(|c| c.queue == queue);
            let auto_delete = self
                .queues
                .get(&queue)
                .is_some_and(|q| q.options.auto_delete && q.had_consumer);
            if no_consumers && auto_delete {
                self.delete_queue(&queue);
            }
        }
    }

    fn close_connection(&mut self, connection: u64) {
        if !self.connections.remove(&connection) {
            return;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }
    }

    fn delete_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != queue);
        }
        self.consumers.retain(|_, c| c.queue != queue);
        tracing::debug!(queue, "queue deleted");
    }
}

/// AMQP topic pattern match: words split on `.`, `*` matches exactly one
/// word, `#` matches zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the lock, then wakes every parked consumer.
    fn mutate<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let result = f(&mut self.lock());
        self.notify.notify_waiters();
        result
    }
}

// ---------------------------------------------------------------------------
// Public handles
// ---------------------------------------------------------------------------

/// An in-process broker. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Creates an empty broker with the `amq.*` exchanges predeclared.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::with_predeclared()),
                notify: Notify::new(),
            }),
        }
    }

    /// Opens a new connection to this broker.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.shared.mutate(|state| {
            let id = state.next_id();
            state.connections.insert(id);
            id
        });
        tracing::debug!(connection = id, "memory broker connection opened");
        MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of ready (not yet delivered) messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Number of delivered but unsettled messages in `queue`.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    /// Options `queue` was declared with.
    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.options.clone())
    }

    /// Returns `true` if `queue` currently exists.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    /// Returns the kind of `exchange` if it exists.
    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.shared.lock().exchanges.get(exchange).map(|e| e.kind)
    }

    /// Number of active consumers on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .consumers
            .values()
            .filter(|c| c.queue == queue)
            .count()
    }

    /// Number of open channels across all connections.
    pub fn channel_count(&self) -> usize {
        let state = self.shared.lock();
        state
            .channels
            .keys()
            .filter(|&&id| state.channel_open(id))
            .count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    /// Closes the connection: its channels close, their unacknowledged
    /// deliveries are requeued, and exclusive queues it declared are deleted.
    pub fn close(&self) {
        self.shared.mutate(|state| state.close_connection(self.id));
        tracing::debug!(connection = self.id, "memory broker connection closed");
    }

    /// Returns `true` until [`close`](Self::close) is called.
    pub fn is_open(&self) -> bool {
        self.shared.lock().connections.contains(&self.id)
    }
}

impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, BrokerError> {
        let id = self
            .shared
            .mutate(|state| -> Result<u64, String> {
                if !state.connections.contains(&self.id) {
                    return Err(format!("connection {} is closed", self.id));
                }
                let id = state.next_id();
                state.channels.insert(
                    id,
                    ChannelState {
                        connection: self.id,
                        prefetch: 0,
                    },
                );
                Ok(id)
            })
            .map_err(|e| BrokerError::Channel(e.into()))?;
        Ok(MemoryChannel {
            id,
            connection: self.id,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl MemoryChannel {
    /// Returns `true` while the channel and its connection are open.
    pub fn is_open(&self) -> bool {
        self.shared.lock().channel_open(self.id)
    }
}

impl BrokerChannel for MemoryChannel {
    type Deliveries = MemoryDeliveries;

    fn id(&self) -> ChannelId {
        ChannelId::new(self.id)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        self.shared
            .mutate(|state| -> Result<(), String> {
                state.ensure_open(self.id)?;
                if name.is_empty() {
                    return Err("ACCESS_REFUSED - cannot redeclare the default exchange".into());
                }
                match state.exchanges.entry(name.to_string()) {
                    Entry::Occupied(existing) => {
                        let existing = existing.get();
                        if existing.kind != kind || existing.durable != durable {
                            return Err(format!(
                                "PRECONDITION_FAILED - inequivalent arg for exchange '{name}' \
                                 (declared {} durable={}, requested {kind} durable={durable})",
                                existing.kind, existing.durable
                            ));
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(ExchangeState {
                            kind,
                            durable,
                            bindings: Vec::new(),
                        });
                        tracing::debug!(exchange = name, %kind, "exchange declared");
                    }
                }
                Ok(())
            })
            .map_err(|e| BrokerError::ExchangeDeclare(e.into()))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, BrokerError> {
        self.shared
            .mutate(|state| -> Result<QueueInfo, String> {
                let connection = state.ensure_open(self.id)?;
                let name = if name.is_empty() {
                    format!("amq.gen-{:016x}", rand::random::<u64>())
                } else {
                    name.to_string()
                };

                if let Some(existing) = state.queues.get(&name) {
                    if existing.owner.is_some_and(|owner| owner != connection) {
                        return Err(format!(
                            "RESOURCE_LOCKED - queue '{name}' is exclusive to another connection"
                        ));
                    }
                    if existing.options != *options {
                        return Err(format!(
                            "PRECONDITION_FAILED - inequivalent arguments for queue '{name}'"
                        ));
                    }
                } else {
                    state.queues.insert(
                        name.clone(),
                        QueueState {
                            options: options.clone(),
                            owner: options.exclusive.then_some(connection),
                            ready: VecDeque::new(),
                            unacked: HashMap::new(),
                            had_consumer: false,
                        },
                    );
                    tracing::debug!(queue = %name, ?options, "queue declared");
                }

                let consumer_count = state.consumers.values().filter(|c| c.queue == name).count();
                let message_count = state.queues.get(&name).map_or(0, |q| q.ready.len());
                Ok(QueueInfo {
                    name,
                    message_count: u32::try_from(message_count).unwrap_or(u32::MAX),
                    consumer_count: u32::try_from(consumer_count).unwrap_or(u32::MAX),
                })
            })
            .map_err(|e| BrokerError::QueueDeclare(e.into()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.shared
            .mutate(|state| -> Result<(), String> {
                state.ensure_open(self.id)?;
                if !state.queues.contains_key(queue) {
                    return Err(format!("NOT_FOUND - no queue '{queue}'"));
                }
                if exchange.is_empty() {
                    return Err("ACCESS_REFUSED - cannot bind to the default exchange".into());
                }
                let target = state
                    .exchanges
                    .get_mut(exchange)
                    .ok_or_else(|| format!("NOT_FOUND - no exchange '{exchange}'"))?;
                let binding = (queue.to_string(), routing_key.to_string());
                if !target.bindings.contains(&binding) {
                    target.bindings.push(binding);
                }
                Ok(())
            })
            .map_err(|e| BrokerError::Bind(e.into()))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.shared
            .mutate(|state| -> Result<(), String> {
                state.ensure_open(self.id)?;
                if let Some(ch) = state.channels.get_mut(&self.id) {
                    ch.prefetch = count;
                }
                Ok(())
            })
            .map_err(|e| BrokerError::Qos(e.into()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<MemoryDeliveries, BrokerError> {
        let tag = self
            .shared
            .mutate(|state| -> Result<String, String> {
                let connection = state.ensure_open(self.id)?;
                let q = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| format!("NOT_FOUND - no queue '{queue}'"))?;
                if q.owner.is_some_and(|owner| owner != connection) {
                    return Err(format!(
                        "RESOURCE_LOCKED - queue '{queue}' is exclusive to another connection"
                    ));
                }
                q.had_consumer = true;

                let tag = if consumer_tag.is_empty() {
                    format!("ctag-{:016x}", rand::random::<u64>())
                } else {
                    consumer_tag.to_string()
                };
                if state.consumers.contains_key(&tag) {
                    return Err(format!("NOT_ALLOWED - consumer tag '{tag}' already in use"));
                }
                state.consumers.insert(
                    tag.clone(),
                    ConsumerState {
                        queue: queue.to_string(),
                        channel: self.id,
                    },
                );
                Ok(tag)
            })
            .map_err(|e| BrokerError::Consume(e.into()))?;

        tracing::debug!(queue, consumer_tag = %tag, channel = self.id, "consumer started");
        Ok(MemoryDeliveries {
            consumer_tag: tag,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage<'_>,
    ) -> Result<(), BrokerError> {
        self.shared
            .mutate(|state| -> Result<(), String> {
                state.ensure_open(self.id)?;
                let targets = state.route(exchange, routing_key)?;
                if targets.is_empty() {
                    tracing::trace!(exchange, routing_key, "unroutable message dropped");
                }
                let stored = StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    payload: message.payload.to_vec(),
                    content_type: message.content_type.to_string(),
                    redelivered: false,
                };
                state.enqueue(&targets, &stored);
                Ok(())
            })
            .map_err(|e| BrokerError::Publish(e.into()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.mutate(|state| state.close_channel(self.id));
        tracing::debug!(channel = self.id, connection = self.connection, "channel closed");
        Ok(())
    }
}

/// Delivery stream of one [`MemoryBroker`] consumer.
pub struct MemoryDeliveries {
    consumer_tag: String,
    shared: Arc<Shared>,
}

impl MemoryDeliveries {
    /// The consumer tag this stream was registered under.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

impl DeliveryStream for MemoryDeliveries {
    type Delivery = MemoryDelivery;

    async fn next_delivery(&mut self) -> Option<Result<MemoryDelivery, BrokerError>> {
        loop {
            // Register interest before checking, so a change between the
            // check and the await still wakes us.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let poll = self.shared.lock().poll(&self.consumer_tag, &self.shared);
            match poll {
                NextDelivery::Ready(delivery) => return Some(Ok(delivery)),
                NextDelivery::Closed => return None,
                NextDelivery::Pending => notified.await,
            }
        }
    }
}

/// A delivery from a [`MemoryBroker`] queue.
pub struct MemoryDelivery {
    shared: Arc<Shared>,
    queue: String,
    delivery_tag: u64,
    payload: Vec<u8>,
    content_type: String,
    redelivered: bool,
}

impl MemoryDelivery {
    fn settle_with(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        self.shared
            .mutate(|state| state.settle(&self.queue, self.delivery_tag, requeue))
            .map_err(|e| BrokerError::Acknowledge(e.into()))
    }
}

impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn content_type(&self) -> Option<&str> {
        Some(self.content_type.as_str()).filter(|ct| !ct.is_empty())
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    async fn ack(self) -> Result<(), BrokerError> {
        self.settle_with(None)
    }

    async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.settle_with(Some(requeue))
    }
}
