//! Messages as they cross the bridging queues.
//!
//! An [`OutboundMessage`] is an already-serialized payload waiting for a
//! producer. An [`Envelope`] is a delivery handed out by a consumer: the
//! broker metadata needed to acknowledge it, the message properties and the
//! serialized body.
use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::{broker::RawDelivery, error::CourierError, serializer::Serializer};

/// The delivery mode of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// A persistent message survives a broker restart when its queue is
    /// durable.
    #[default]
    Persistent,
    /// A transient message is lost if the broker restarts.
    Transient,
}

impl DeliveryMode {
    /// The AMQP `delivery-mode` property value.
    pub fn as_amqp(&self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }

    pub fn from_amqp(mode: Option<u8>) -> Self {
        match mode {
            Some(2) => Self::Persistent,
            _ => Self::Transient,
        }
    }
}

/// Message properties carried alongside the body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    /// Identity of the sending application.
    pub app_id: Option<String>,
}

/// Broker-side metadata of a single delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub exchange: String,
    pub routing_key: String,
    /// Only meaningful on the channel that delivered the message.
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// A message delivered to a consumer.
///
/// Each envelope is dequeued by exactly one caller. Its delivery tag can be
/// acknowledged until the channel that delivered it is closed or replaced by a
/// reconnection; after that, acknowledging it yields
/// [`CourierError::StaleDeliveryTag`].
#[derive(Clone, Debug)]
pub struct Envelope {
    pub delivery: DeliveryInfo,
    pub properties: MessageProperties,
    pub body: Bytes,
    /// The exchange whose consumer delivered this envelope.
    pub(crate) origin: String,
    /// The channel generation of the consumer session that produced this
    /// envelope.
    pub(crate) generation: u64,
}

impl Envelope {
    pub(crate) fn new(origin: &str, generation: u64, raw: RawDelivery) -> Self {
        Self {
            delivery: DeliveryInfo {
                exchange: raw.exchange,
                routing_key: raw.routing_key,
                delivery_tag: raw.delivery_tag,
                redelivered: raw.redelivered,
            },
            properties: raw.properties,
            body: raw.body,
            origin: origin.to_string(),
            generation,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    /// Decode the body with the serializer matching its content type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CourierError> {
        Serializer::from_content_type(self.properties.content_type.as_deref())
            .from_bytes(&self.body)
            .map_err(|e| CourierError::DeserializationFailed(e.to_string()))
    }
}

/// A serialized payload queued for publication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Bytes,
    pub content_type: &'static str,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Bytes>, serializer: Serializer) -> Self {
        Self {
            body: body.into(),
            content_type: serializer.content_type(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_decode_by_content_type() {
        let body = Serializer::Cbor.to_bytes(&("north", 7u8)).unwrap();
        let raw = RawDelivery {
            exchange: "readings".into(),
            routing_key: "arbitrary_string".into(),
            delivery_tag: 1,
            redelivered: false,
            properties: MessageProperties {
                content_type: Some("application/cbor".into()),
                ..Default::default()
            },
            body: body.into(),
        };
        let envelope = Envelope::new("readings", 1, raw);
        assert_eq!(envelope.delivery_tag(), 1);

        let decoded: (String, u8) = envelope.decode().unwrap();
        assert_eq!(decoded, ("north".to_string(), 7));
        assert!(matches!(
            envelope.decode::<Vec<String>>(),
            Err(CourierError::DeserializationFailed(_))
        ));
    }

    #[test]
    fn delivery_mode_maps_to_amqp_values() {
        assert_eq!(DeliveryMode::Persistent.as_amqp(), 2);
        assert_eq!(DeliveryMode::from_amqp(Some(2)), DeliveryMode::Persistent);
        assert_eq!(DeliveryMode::from_amqp(None), DeliveryMode::Transient);
    }
}
