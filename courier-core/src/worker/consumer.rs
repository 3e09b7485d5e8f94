//! The consumer variant: broker deliveries in, envelopes out.
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use crossbeam::channel::Sender;
use futures::StreamExt;
use rand::{distributions::Alphanumeric, Rng};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::{ChannelWorker, Role, Topology, WorkerSettings, WorkerShared};
use crate::{
    bridge::BridgeQueue,
    broker::{Broker, Channel, ChannelOf, RawDelivery},
    error::CourierError,
    message::Envelope,
};

/// Settlement requests marshalled into the consumer's event loop.
///
/// `generation` is the channel generation of the envelope being settled; a
/// mismatch with the live channel is answered with
/// [`CourierError::StaleDeliveryTag`] without touching the broker.
#[derive(Debug)]
pub enum ConsumerCommand {
    Ack {
        delivery_tag: u64,
        generation: u64,
        reply: Sender<Result<(), CourierError>>,
    },
    Nack {
        delivery_tag: u64,
        generation: u64,
        requeue: bool,
        reply: Sender<Result<(), CourierError>>,
    },
}

/// Random consumer tag, unique per channel generation.
fn consumer_tag(exchange: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();
    format!("courier-{exchange}-{suffix}")
}

pub struct ConsumerWorker<B: Broker> {
    topology: Topology,
    bridge: Arc<BridgeQueue<Envelope>>,
    shared: Arc<WorkerShared>,
    prefetch_count: u16,
    generation: u64,
    consumer_tag: Option<String>,
    deliveries: Option<<ChannelOf<B> as Channel>::Deliveries>,
}

impl<B: Broker> ConsumerWorker<B> {
    pub fn new(
        topology: Topology,
        bridge: Arc<BridgeQueue<Envelope>>,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            topology,
            bridge,
            shared: Arc::new(WorkerShared::new()),
            prefetch_count: settings.prefetch_count,
            generation: 0,
            consumer_tag: None,
            deliveries: None,
        }
    }

    fn deliver(&self, raw: RawDelivery) {
        trace!(
            delivery_tag = raw.delivery_tag,
            redelivered = raw.redelivered,
            "received"
        );
        self.bridge
            .push(Envelope::new(&self.topology.exchange, self.generation, raw));
    }

    /// Ack or nack on this thread, replying to the caller. Only a failure that
    /// left the channel closed is returned as an error.
    #[instrument(skip_all, level = "debug")]
    async fn settle(&mut self, channel: &ChannelOf<B>, command: ConsumerCommand) -> Result<()> {
        let (delivery_tag, generation, requeue, reply) = match command {
            ConsumerCommand::Ack {
                delivery_tag,
                generation,
                reply,
            } => (delivery_tag, generation, None, reply),
            ConsumerCommand::Nack {
                delivery_tag,
                generation,
                requeue,
                reply,
            } => (delivery_tag, generation, Some(requeue), reply),
        };

        let result = if generation != self.generation {
            debug!(delivery_tag, generation, "stale delivery tag");
            Err(CourierError::StaleDeliveryTag {
                exchange: self.topology.exchange.clone(),
                tag: delivery_tag,
            })
        } else {
            let (operation, outcome) = match requeue {
                None => ("ack", channel.ack(delivery_tag).await),
                Some(requeue) => ("nack", channel.nack(delivery_tag, requeue).await),
            };
            outcome.map_err(|err| CourierError::Broker {
                operation,
                exchange: self.topology.exchange.clone(),
                reason: format!("{err:#}"),
            })
        };

        let failed = result.is_err();
        let _ = reply.send(result);
        if failed && !channel.is_open() {
            bail!("channel closed while settling delivery {delivery_tag}");
        }
        Ok(())
    }
}

#[async_trait]
impl<B: Broker> ChannelWorker for ConsumerWorker<B> {
    type Broker = B;
    type Command = ConsumerCommand;

    const ROLE: Role = Role::Consumer;

    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    async fn on_ready(&mut self, channel: &ChannelOf<B>, generation: u64) -> Result<()> {
        // Tags from the previous channel cannot be settled anymore.
        let discarded = self.bridge.clear();
        if discarded > 0 {
            warn!(discarded, "discarded deliveries from the previous channel");
        }
        self.generation = generation;

        channel.qos(self.prefetch_count).await?;
        let tag = consumer_tag(&self.topology.exchange);
        let deliveries = channel.consume(&self.topology.queue, &tag).await?;
        debug!(consumer_tag = %tag, prefetch = self.prefetch_count, "consuming");
        self.consumer_tag = Some(tag);
        self.deliveries = Some(deliveries);
        Ok(())
    }

    async fn run(
        &mut self,
        channel: &ChannelOf<B>,
        commands: &mut UnboundedReceiver<ConsumerCommand>,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut deliveries = self
            .deliveries
            .take()
            .ok_or_else(|| anyhow!("the consumer is not ready"))?;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                command = commands.recv() => match command {
                    Some(command) => self.settle(channel, command).await?,
                    None => return Ok(()),
                },
                delivery = deliveries.next() => match delivery {
                    Some(Ok(raw)) => self.deliver(raw),
                    Some(Err(err)) => return Err(err.context("delivery stream failed")),
                    None => bail!("the broker closed the delivery stream"),
                },
            }
        }
    }

    async fn stop(&mut self, channel: &ChannelOf<B>) -> Result<()> {
        self.deliveries = None;
        if let Some(tag) = self.consumer_tag.take() {
            channel.cancel(&tag).await?;
            debug!(consumer_tag = %tag, "cancelled consumer");
        }
        Ok(())
    }

    fn handle_offline(&mut self, command: ConsumerCommand) {
        let (delivery_tag, reply) = match command {
            ConsumerCommand::Ack {
                delivery_tag,
                reply,
                ..
            }
            | ConsumerCommand::Nack {
                delivery_tag,
                reply,
                ..
            } => (delivery_tag, reply),
        };
        let _ = reply.send(Err(CourierError::StaleDeliveryTag {
            exchange: self.topology.exchange.clone(),
            tag: delivery_tag,
        }));
    }
}
