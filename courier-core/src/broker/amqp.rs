//! AMQP broker binding using [`lapin`].
//!
//! Connections are driven by the tokio runtime of the worker thread that opens
//! them, so the executor and reactor are taken from the current runtime.
//!
//! # Example
//!
//! ```no_run
//! use courier::{
//!     broker::{amqp::AmqpBroker, Broker, Channel, Connection},
//!     config::{Credentials, ExchangeKind},
//! };
//! use anyhow::Result;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let credentials = Credentials::from_file("courier.json".as_ref(), "local")?;
//!     let broker = AmqpBroker::new(credentials);
//!     let connection = broker.connect().await?;
//!     let channel = connection.open_channel().await?;
//!     channel.declare_exchange("readings", ExchangeKind::Fanout).await?;
//!     channel.close().await?;
//!     connection.close().await?;
//!     Ok(())
//! }
//! ```
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::Stream;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString, ShortString},
    BasicProperties,
};
use pin_project::pin_project;
use tracing::{debug, instrument};

use super::{Broker, Channel, Connection, PublishStatus, RawDelivery};
use crate::{
    config::{Credentials, ExchangeKind},
    message::{DeliveryMode, MessageProperties},
};

/// A [`Broker`] that connects with the given [`Credentials`].
#[derive(Clone, Debug)]
pub struct AmqpBroker {
    credentials: Arc<Credentials>,
}

impl AmqpBroker {
    pub fn new(credentials: impl Into<Arc<Credentials>>) -> Self {
        Self {
            credentials: credentials.into(),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Connection = AmqpConnection;

    #[instrument(skip(self), fields(host = %self.credentials.host, port = self.credentials.port), level = "debug")]
    async fn connect(&self) -> Result<AmqpConnection> {
        let options = lapin::ConnectionProperties::default()
            .with_connection_name(LongString::from(format!(
                "courier/{}",
                self.credentials.profile
            )))
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = lapin::Connection::connect_uri_with_config(
            self.credentials.amqp_uri(),
            options,
            self.credentials.tls_config()?,
        )
        .await?;
        debug!("amqp connected");

        Ok(AmqpConnection {
            connection: Arc::new(connection),
        })
    }
}

/// An open AMQP connection.
#[derive(Clone)]
pub struct AmqpConnection {
    connection: Arc<lapin::Connection>,
}

#[async_trait]
impl Connection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel> {
        let channel = self.connection.create_channel().await?;
        Ok(AmqpChannel { channel })
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "Goodbye").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }
}

/// A channel on an [`AmqpConnection`].
#[derive(Clone)]
pub struct AmqpChannel {
    channel: lapin::Channel,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_delivery_mode(properties.delivery_mode.as_amqp());
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(app_id) = &properties.app_id {
        basic = basic.with_app_id(ShortString::from(app_id.clone()));
    }
    basic
}

fn from_delivery(delivery: lapin::message::Delivery) -> RawDelivery {
    let properties = MessageProperties {
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.to_string()),
        delivery_mode: DeliveryMode::from_amqp(*delivery.properties.delivery_mode()),
        app_id: delivery.properties.app_id().as_ref().map(|id| id.to_string()),
    };

    RawDelivery {
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        properties,
        body: delivery.data.into(),
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    type Deliveries = AmqpDeliveries;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    #[instrument(skip(self, body, properties), level = "trace")]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishStatus> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                body,
                to_basic_properties(properties),
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(PublishStatus::Confirmed),
            Confirmation::Ack(Some(_)) => Ok(PublishStatus::Unroutable),
            Confirmation::Nack(_) => bail!("broker negatively acknowledged the publish"),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<AmqpDeliveries> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(AmqpDeliveries { inner: consumer })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "Goodbye").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

/// The delivery stream of an [`AmqpChannel`] consumer.
#[pin_project]
pub struct AmqpDeliveries {
    #[pin]
    inner: lapin::Consumer,
}

impl Stream for AmqpDeliveries {
    type Item = Result<RawDelivery>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(delivery))) => Poll::Ready(Some(Ok(from_delivery(delivery)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
