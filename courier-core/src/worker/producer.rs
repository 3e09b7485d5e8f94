//! The producer variant: serialized messages in, broker publishes out.
use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use async_trait::async_trait;
use crossbeam::channel::Sender;
use tokio::{
    sync::mpsc::UnboundedReceiver,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ChannelWorker, Role, Topology, WorkerSettings, WorkerShared};
use crate::{
    bridge::BridgeQueue,
    broker::{Broker, Channel, ChannelOf, PublishStatus},
    config::ReconnectPolicy,
    message::{DeliveryMode, MessageProperties, OutboundMessage},
};

#[derive(Debug)]
pub enum ProducerCommand {
    /// Reply, with the published counter, once everything queued before the
    /// command has been published.
    Flush { reply: Sender<u64> },
}

pub struct ProducerWorker<B: Broker> {
    topology: Topology,
    bridge: Arc<BridgeQueue<OutboundMessage>>,
    shared: Arc<WorkerShared>,
    reconnect: ReconnectPolicy,
    poll_interval: Duration,
    max_attempts: u32,
    app_id: String,
    /// Taken off the bridge but not yet published.
    in_flight: Option<OutboundMessage>,
    /// Attempts and cause of the last exhausted publish, until a publish
    /// succeeds again.
    last_failure: Option<(u32, String)>,
    pending_flushes: Vec<Sender<u64>>,
    _broker: std::marker::PhantomData<fn() -> B>,
}

impl<B: Broker> ProducerWorker<B> {
    pub fn new(
        topology: Topology,
        bridge: Arc<BridgeQueue<OutboundMessage>>,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            topology,
            bridge,
            shared: Arc::new(WorkerShared::new()),
            reconnect: settings.reconnect,
            poll_interval: settings.poll_interval,
            max_attempts: settings.publish_attempts.max(1),
            app_id: settings.app_id.clone(),
            in_flight: None,
            last_failure: None,
            pending_flushes: Vec::new(),
            _broker: std::marker::PhantomData,
        }
    }

    fn properties(&self, message: &OutboundMessage) -> MessageProperties {
        MessageProperties {
            content_type: Some(message.content_type.to_string()),
            delivery_mode: DeliveryMode::Persistent,
            app_id: Some(self.app_id.clone()),
        }
    }

    /// Publish one message, retrying up to `max_attempts` times with the
    /// reconnect delay in between.
    async fn publish(&mut self, channel: &ChannelOf<B>, message: &OutboundMessage) -> Result<()> {
        let properties = self.properties(message);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = channel
                .publish(
                    &self.topology.exchange,
                    &self.topology.routing_key,
                    &message.body,
                    &properties,
                )
                .await;

            match outcome {
                Ok(status) => {
                    let count = self.shared.record_published();
                    match status {
                        PublishStatus::Confirmed => trace!(count, "published"),
                        PublishStatus::Unroutable => warn!(
                            count,
                            routing_key = %self.topology.routing_key,
                            "message was returned as unroutable"
                        ),
                    }
                    if let Some((attempts, _)) = self.last_failure.take() {
                        info!(attempts, "publishing recovered");
                    }
                    return Ok(());
                }
                Err(err) if attempt < self.max_attempts => {
                    warn!(attempt, error = %err, "publish failed, retrying");
                    if let Some(delay) = self.reconnect.delay() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    self.last_failure = Some((attempt, format!("{err:#}")));
                    return Err(err.context(format!("publish failed after {attempt} attempt(s)")));
                }
            }
        }
    }

    /// Publish everything queued, oldest first. A message that cannot be
    /// published stays in flight for the next channel.
    async fn pump(&mut self, channel: &ChannelOf<B>) -> Result<()> {
        while let Some(message) = self.in_flight.take().or_else(|| self.bridge.try_pop()) {
            if let Err(err) = self.publish(channel, &message).await {
                self.in_flight = Some(message);
                return Err(err);
            }
        }

        let published = self.shared.published();
        for reply in self.pending_flushes.drain(..) {
            let _ = reply.send(published);
        }
        Ok(())
    }
}

#[async_trait]
impl<B: Broker> ChannelWorker for ProducerWorker<B> {
    type Broker = B;
    type Command = ProducerCommand;

    const ROLE: Role = Role::Producer;

    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    async fn on_ready(&mut self, channel: &ChannelOf<B>, _generation: u64) -> Result<()> {
        channel.enable_confirms().await?;
        if self.in_flight.is_some() {
            info!("retrying the message left over from the previous channel");
        }
        Ok(())
    }

    async fn run(
        &mut self,
        channel: &ChannelOf<B>,
        commands: &mut UnboundedReceiver<ProducerCommand>,
        token: &CancellationToken,
    ) -> Result<()> {
        let bridge = self.bridge.clone();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.pump(channel).await?;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                command = commands.recv() => match command {
                    Some(ProducerCommand::Flush { reply }) => {
                        self.pending_flushes.push(reply);
                        self.pump(channel).await?;
                    }
                    None => return Ok(()),
                },
                _ = bridge.notified() => self.pump(channel).await?,
                _ = ticker.tick() => {
                    if !channel.is_open() {
                        bail!("the channel was closed by the broker");
                    }
                    self.pump(channel).await?;
                }
            }
        }
    }

    async fn stop(&mut self, channel: &ChannelOf<B>) -> Result<()> {
        let queued = self.bridge.len() + usize::from(self.in_flight.is_some());
        if queued > 0 {
            debug!(queued, "publishing queued messages before closing");
        }
        self.pump(channel).await
    }

    fn handle_offline(&mut self, command: ProducerCommand) {
        match command {
            ProducerCommand::Flush { reply } => self.pending_flushes.push(reply),
        }
    }

    fn on_stopped(&mut self) {
        let dropped = self.bridge.clear() + usize::from(self.in_flight.take().is_some());
        if dropped == 0 {
            return;
        }

        let (attempts, cause) = match self.last_failure.take() {
            Some(failure) => failure,
            None => (
                0,
                self.shared
                    .terminal_reason()
                    .unwrap_or_else(|| "the producer stopped while disconnected".to_string()),
            ),
        };
        warn!(dropped, attempts, cause = %cause, "stopped with unpublished messages");
        self.shared.record_publish_failure(
            attempts,
            format!("{dropped} queued message(s) were dropped: {cause}"),
        );
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel::bounded;
    use tracing::Level;

    use super::*;
    use crate::{
        broker::in_memory::InMemoryBroker,
        config::ExchangeKind,
        serializer::Serializer,
        worker::{WorkerHandle, WorkerState},
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn settings(dir: &tempfile::TempDir) -> WorkerSettings {
        WorkerSettings {
            reconnect: ReconnectPolicy::After(Duration::from_millis(20)),
            poll_interval: Duration::from_millis(10),
            prefetch_count: 5,
            publish_attempts: 1,
            app_id: "sensors".into(),
            shutdown_timeout: Duration::from_secs(1),
            log_file: dir.path().join("producer.log"),
            log_level: Level::DEBUG,
        }
    }

    fn start(
        broker: &InMemoryBroker,
        settings: &WorkerSettings,
    ) -> (
        Arc<BridgeQueue<OutboundMessage>>,
        WorkerHandle<ProducerCommand>,
    ) {
        let topology =
            Topology::new("alerts", Some("q"), "arbitrary_string", ExchangeKind::Fanout).unwrap();
        let bridge = Arc::new(BridgeQueue::new());
        let worker = ProducerWorker::<InMemoryBroker>::new(topology, bridge.clone(), settings);
        let handle = WorkerHandle::spawn(worker, Arc::new(broker.clone()), settings).unwrap();
        (bridge, handle)
    }

    fn flush(handle: &WorkerHandle<ProducerCommand>) -> u64 {
        let (reply, response) = bounded(1);
        handle
            .send_command(ProducerCommand::Flush { reply })
            .unwrap();
        response.recv_timeout(WAIT).unwrap()
    }

    fn message(text: &str) -> OutboundMessage {
        OutboundMessage::new(Serializer::Json.to_bytes(text).unwrap(), Serializer::Json)
    }

    #[test]
    fn flush_waits_for_queued_messages() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let broker = InMemoryBroker::new();
        let (bridge, handle) = start(&broker, &settings);

        for text in ["one", "two", "three"] {
            bridge.push(message(text));
        }
        assert_eq!(flush(&handle), 3);
        assert_eq!(handle.published(), 3);
        assert_eq!(broker.ready_count("alerts.q"), 3);
        handle.stop();
    }

    #[test]
    fn messages_survive_a_broker_outage() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let broker = InMemoryBroker::new();
        let (bridge, handle) = start(&broker, &settings);
        handle.wait_for_state(|s| s == WorkerState::Connected, WAIT);

        broker.set_online(false);
        bridge.push(message("during outage"));
        let state = handle.wait_for_state(|s| s == WorkerState::ReconnectWait, WAIT);
        assert_eq!(state, WorkerState::ReconnectWait);

        broker.set_online(true);
        assert_eq!(flush(&handle), 1);
        assert_eq!(broker.ready_count("alerts.q"), 1);
        handle.stop();
    }

    #[test]
    fn a_recovered_publish_is_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let broker = InMemoryBroker::new();
        let (bridge, handle) = start(&broker, &settings);

        bridge.push(message("before"));
        assert_eq!(flush(&handle), 1);

        broker.sever_connections();
        bridge.push(message("during reconnect"));
        let deadline = std::time::Instant::now() + WAIT;
        while broker.ready_count("alerts.q") < 2 {
            assert!(std::time::Instant::now() < deadline, "message was never republished");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.take_publish_failure(), None);

        bridge.push(message("after"));
        assert_eq!(flush(&handle), 3);
        assert_eq!(broker.ready_count("alerts.q"), 3);
        handle.stop();
    }

    #[test]
    fn stopping_with_unpublished_messages_records_them() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let topology =
            Topology::new("alerts", Some("q"), "arbitrary_string", ExchangeKind::Fanout).unwrap();
        let bridge = Arc::new(BridgeQueue::new());
        let mut worker = ProducerWorker::<InMemoryBroker>::new(topology, bridge.clone(), &settings);

        worker.on_stopped();
        assert_eq!(worker.shared().take_publish_failure(), None);

        bridge.push(message("queued"));
        worker.in_flight = Some(message("in flight"));
        worker.last_failure = Some((1, "channel 2 is closed".to_string()));
        worker.on_stopped();

        let (attempts, reason) = worker.shared().take_publish_failure().unwrap();
        assert_eq!(attempts, 1);
        assert!(reason.contains("2 queued message(s) were dropped"));
        assert!(reason.contains("channel 2 is closed"));
        assert!(bridge.is_empty());
    }

    #[test]
    fn stop_publishes_what_is_still_queued() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let broker = InMemoryBroker::new();
        let (bridge, handle) = start(&broker, &settings);
        handle.wait_for_state(|s| s == WorkerState::Connected, WAIT);

        for text in ["a", "b"] {
            bridge.push(message(text));
        }
        assert!(handle.stop());
        assert_eq!(broker.ready_count("alerts.q"), 2);
        assert!(bridge.is_empty());
    }

    #[test]
    fn published_messages_are_persistent_and_identified() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let topology =
            Topology::new("alerts", Some("q"), "arbitrary_string", ExchangeKind::Fanout).unwrap();
        let worker = ProducerWorker::<InMemoryBroker>::new(
            topology,
            Arc::new(BridgeQueue::new()),
            &settings,
        );

        let properties = worker.properties(&message("x"));
        assert_eq!(properties.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(properties.content_type.as_deref(), Some("application/json"));
        assert_eq!(properties.app_id.as_deref(), Some("sensors"));
    }
}
