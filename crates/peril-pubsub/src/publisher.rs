//! Publishing typed values.

use peril_broker::{BrokerChannel, BrokerConnection, OutboundMessage};
use peril_codec::{CborCodec, Codec, JsonCodec};
use serde::Serialize;

use crate::PubSubError;

/// Encodes `value` with `codec` and publishes it to `exchange` under
/// `routing_key`.
///
/// The message is non-persistent, non-mandatory and non-immediate, tagged
/// with the codec's content type. Nothing is awaited beyond the publish
/// call itself (no publisher confirms).
///
/// # Errors
/// - [`PubSubError::Codec`] if encoding fails; the broker is not contacted.
/// - [`PubSubError::Broker`] with the broker's error, unchanged. No retry.
pub async fn publish<Ch, T, C>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &C,
) -> Result<(), PubSubError>
where
    Ch: BrokerChannel,
    T: Serialize,
    C: Codec,
{
    let payload = codec.encode(value)?;
    channel
        .publish(
            exchange,
            routing_key,
            OutboundMessage {
                payload: &payload,
                content_type: codec.content_type(),
                persistent: false,
            },
        )
        .await?;
    tracing::debug!(
        exchange,
        routing_key,
        content_type = codec.content_type(),
        bytes = payload.len(),
        "published"
    );
    Ok(())
}

/// A publishing channel.
///
/// Owns one broker channel; publishes from several tasks should go through
/// separate publishers.
pub struct Publisher<Ch: BrokerChannel> {
    channel: Ch,
}

impl<Ch: BrokerChannel> Publisher<Ch> {
    /// Opens a dedicated channel on `connection`.
    pub async fn open<C>(connection: &C) -> Result<Self, PubSubError>
    where
        C: BrokerConnection<Channel = Ch>,
    {
        let channel = connection
            .create_channel()
            .await
            .map_err(PubSubError::Connection)?;
        Ok(Self { channel })
    }

    /// Wraps a channel the caller already opened.
    pub fn from_channel(channel: Ch) -> Self {
        Self { channel }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Ch {
        &self.channel
    }

    /// Publishes `value` encoded with `codec`. See [`publish`].
    pub async fn publish<T: Serialize, C: Codec>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
        codec: &C,
    ) -> Result<(), PubSubError> {
        publish(&self.channel, exchange, routing_key, value, codec).await
    }

    /// Publishes `value` as JSON.
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), PubSubError> {
        self.publish(exchange, routing_key, value, &JsonCodec).await
    }

    /// Publishes `value` as CBOR.
    pub async fn publish_cbor<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), PubSubError> {
        self.publish(exchange, routing_key, value, &CborCodec).await
    }

    /// Closes the channel.
    pub async fn close(self) -> Result<(), PubSubError> {
        self.channel.close().await.map_err(PubSubError::Broker)
    }
}
