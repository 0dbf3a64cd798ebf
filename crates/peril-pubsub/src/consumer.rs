//! The consumer engine: subscription setup and the per-subscription worker.
//!
//! Each subscription runs as one Tokio task that exclusively owns its broker
//! channel and delivery stream. Nothing else ever acknowledges deliveries
//! from that channel, so the engine needs no locks.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};

use peril_broker::{BrokerChannel, BrokerConnection, BrokerError, Delivery, DeliveryStream};
use peril_codec::Codec;
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::subscription::transition;
use crate::{
    AckType, Binding, Handler, PubSubConfig, PubSubError, SubscriptionEnd, SubscriptionHandle,
    SubscriptionState, Topology,
};

/// Starts subscriptions.
///
/// Holds only configuration; the broker connection is passed per call and
/// may be shared by any number of subscriptions.
#[derive(Debug, Clone)]
pub struct ConsumerEngine {
    topology: Topology,
}

impl ConsumerEngine {
    /// Creates an engine from config.
    pub fn new(config: PubSubConfig) -> Self {
        Self {
            topology: Topology::new(config),
        }
    }

    /// The config this engine was built with.
    pub fn config(&self) -> &PubSubConfig {
        self.topology.config()
    }

    /// The topology manager subscriptions are declared through.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declares and binds `binding`, then starts a worker that decodes each
    /// delivery with `codec`, passes it to `handler`, and settles it with the
    /// handler's verdict.
    ///
    /// Returns once the worker is running. Deliveries that fail to decode are
    /// discarded without calling the handler.
    ///
    /// # Errors
    /// [`PubSubError::Connection`] if opening the channel, declaring,
    /// binding, setting prefetch or starting the consumer fails. No worker
    /// is started in that case.
    pub async fn subscribe<Conn, T, C, H>(
        &self,
        connection: &Conn,
        binding: Binding,
        codec: C,
        handler: H,
    ) -> Result<SubscriptionHandle, PubSubError>
    where
        Conn: BrokerConnection,
        T: DeserializeOwned + Send + 'static,
        C: Codec,
        H: Handler<T>,
    {
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Initializing);
        transition(&state_tx, SubscriptionState::Declaring);

        let (channel, queue) = match self.topology.declare_and_bind(connection, &binding).await {
            Ok(declared) => declared,
            Err(e) => {
                warn!(exchange = %binding.exchange, queue = %binding.queue, error = %e, "subscription setup failed");
                return Err(e);
            }
        };

        let prefetch = self.config().prefetch_count;
        let deliveries = match start_consumer(&channel, &queue.name, prefetch).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                warn!(queue = %queue.name, error = %e, "starting consumer failed");
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "closing channel after failed consume");
                }
                return Err(PubSubError::Connection(e));
            }
        };

        transition(&state_tx, SubscriptionState::Consuming);
        info!(
            queue = %queue.name,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            prefetch,
            content_type = codec.content_type(),
            "subscription started"
        );

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let worker = Worker {
            queue: queue.name.clone(),
            channel,
            deliveries,
            codec,
            handler,
            state: state_tx,
            _value: PhantomData,
        };
        let task = tokio::spawn(worker.run(cancel_rx));

        Ok(SubscriptionHandle::new(queue.name, state_rx, cancel_tx, task))
    }
}

async fn start_consumer<Ch: BrokerChannel>(
    channel: &Ch,
    queue: &str,
    prefetch: u16,
) -> Result<Ch::Deliveries, BrokerError> {
    channel.set_prefetch(prefetch).await?;
    channel.consume(queue, "").await
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// The task body of one subscription.
struct Worker<Ch: BrokerChannel, T, C, H> {
    queue: String,
    channel: Ch,
    deliveries: Ch::Deliveries,
    codec: C,
    handler: H,
    state: watch::Sender<SubscriptionState>,
    _value: PhantomData<fn() -> T>,
}

impl<Ch, T, C, H> Worker<Ch, T, C, H>
where
    Ch: BrokerChannel,
    T: DeserializeOwned + Send + 'static,
    C: Codec,
    H: Handler<T>,
{
    /// Runs until the stream ends, cancellation is requested, or an
    /// acknowledgement fails.
    async fn run(
        mut self,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<SubscriptionEnd, PubSubError> {
        // A dropped handle drops the sender; keep consuming in that case.
        let mut cancel_armed = true;

        let end = loop {
            let next = tokio::select! {
                biased;
                signal = &mut cancel, if cancel_armed => match signal {
                    Ok(()) => break SubscriptionEnd::Cancelled,
                    Err(_) => {
                        cancel_armed = false;
                        continue;
                    }
                },
                next = self.deliveries.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => match self.process(delivery).await {
                    Ok(()) => {}
                    Err(Fault::Ack(source)) => {
                        error!(queue = %self.queue, error = %source, "acknowledgement failed, stopping subscription");
                        transition(&self.state, SubscriptionState::Failed);
                        close_channel(&self.channel, &self.queue).await;
                        return Err(PubSubError::AckProtocol {
                            queue: self.queue,
                            source,
                        });
                    }
                    Err(Fault::HandlerPanicked(reason)) => {
                        error!(queue = %self.queue, %reason, "handler panicked, stopping subscription");
                        transition(&self.state, SubscriptionState::Failed);
                        // The unsettled delivery is requeued with the channel.
                        close_channel(&self.channel, &self.queue).await;
                        return Err(PubSubError::WorkerAborted {
                            queue: self.queue,
                            reason,
                        });
                    }
                },
                Some(Err(e)) => {
                    warn!(queue = %self.queue, error = %e, "delivery stream error");
                    break SubscriptionEnd::StreamClosed;
                }
                None => break SubscriptionEnd::StreamClosed,
            }
        };

        // Unsettled prefetched deliveries go back to the queue on close.
        close_channel(&self.channel, &self.queue).await;
        transition(&self.state, SubscriptionState::Closed);
        info!(queue = %self.queue, ?end, "subscription stopped");
        Ok(end)
    }

    /// Decodes one delivery, runs the handler and settles the delivery.
    ///
    /// A panicking handler leaves the delivery unsettled.
    async fn process(
        &mut self,
        delivery: <Ch::Deliveries as DeliveryStream>::Delivery,
    ) -> Result<(), Fault> {
        let tag = delivery.delivery_tag();
        if let Some(content_type) = delivery.content_type() {
            if content_type != self.codec.content_type() {
                debug!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    content_type,
                    expected = self.codec.content_type(),
                    "content type mismatch, decoding anyway"
                );
            }
        }

        let verdict = match self.codec.decode::<T>(delivery.payload()) {
            Ok(value) => {
                let handler = &mut self.handler;
                catch_unwind(AssertUnwindSafe(|| handler.handle(value)))
                    .map_err(|payload| Fault::HandlerPanicked(panic_message(payload.as_ref())))?
            }
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    error = %e,
                    "discarding malformed delivery"
                );
                AckType::NackDiscard
            }
        };

        debug!(
            queue = %self.queue,
            delivery_tag = tag,
            redelivered = delivery.redelivered(),
            %verdict,
            "settling delivery"
        );
        delivery
            .settle(verdict.disposition())
            .await
            .map_err(Fault::Ack)
    }
}

/// Why a worker has to stop mid-stream.
enum Fault {
    Ack(BrokerError),
    HandlerPanicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

async fn close_channel<Ch: BrokerChannel>(channel: &Ch, queue: &str) {
    if let Err(e) = channel.close().await {
        debug!(queue, error = %e, "closing subscription channel");
    }
}
