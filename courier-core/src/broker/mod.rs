//! Simplified interface for interacting with an AMQP 0-9-1 broker.
//!
//! Workers only need a small slice of the protocol: open a connection, open a
//! channel, declare an exchange and a durable queue, bind them, publish,
//! consume, acknowledge and close. These traits capture exactly that slice so
//! that the worker state machine is independent of the client library.
//!
//! Two implementations are provided:
//! - [`amqp::AmqpBroker`], backed by [`lapin`].
//! - [`in_memory::InMemoryBroker`], an in-process emulation with the same
//!   acknowledgement semantics, used to exercise workers without a live
//!   broker.
//!
//! Connections and channels are driven only by the worker thread that opened
//! them. Nothing here is shared with caller threads.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::{config::ExchangeKind, message::MessageProperties};

/// A message as handed over by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDelivery {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Bytes,
}

/// The broker's verdict on a mandatory publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishStatus {
    /// Routed to at least one queue (or confirms are not enabled).
    Confirmed,
    /// No queue was bound for the routing key; the broker returned it.
    Unroutable,
}

/// Entry point to a broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection>;
}

/// A connection to a broker.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    async fn open_channel(&self) -> Result<Self::Channel>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// A channel on a [`Connection`].
///
/// Delivery tags are scoped to the channel that produced them.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    type Deliveries: Stream<Item = Result<RawDelivery>> + Send + Unpin + 'static;

    /// Declare a durable exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Declare a durable queue.
    ///
    /// Declaration is idempotent: an existing queue is left as it is.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit the number of unacknowledged deliveries held by this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    /// Ask the broker to confirm publishes.
    async fn enable_confirms(&self) -> Result<()>;

    /// Publish a message with the mandatory flag set.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishStatus>;

    /// Start a manually acknowledged consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Self::Deliveries>;

    /// Stop the consumer registered under `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// The connection type of a broker.
pub type ConnectionOf<B> = <B as Broker>::Connection;

/// The channel type of a broker.
pub type ChannelOf<B> = <ConnectionOf<B> as Connection>::Channel;

pub mod amqp;
pub mod in_memory;
