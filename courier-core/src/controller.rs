//! The synchronous facade.
//!
//! A [`Controller`] maps exchange names to workers, one registration per
//! exchange and direction. Workers are started lazily on first use and live
//! until the controller is closed. Every public method may be called from any
//! thread; none of them touches a broker connection directly.
//!
//! ```no_run
//! use courier::{config::{ControllerOptions, ExchangeKind}, controller::Controller};
//!
//! let options = ControllerOptions::new("local", "/tmp/courier.log");
//! let controller = Controller::new_or_exit(options);
//!
//! controller.send("Hello, world!", "basic", Some("q"), ExchangeKind::Fanout)?;
//! if let Some(envelope) = controller.receive("basic", Some("q"), true, None, ExchangeKind::Fanout)? {
//!     let text: String = envelope.decode()?;
//!     assert_eq!(text, "Hello, world!");
//! }
//! controller.close();
//! # Ok::<(), courier::CourierError>(())
//! ```
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam::channel::{bounded, RecvTimeoutError};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    bridge::BridgeQueue,
    broker::{amqp::AmqpBroker, Broker},
    config::{ConfigError, ControllerOptions, Credentials, ExchangeKind},
    error::{CourierError, Result},
    message::{Envelope, OutboundMessage},
    serializer::Serializer,
    worker::{
        ChannelWorker, ConsumerCommand, ConsumerWorker, ProducerCommand, ProducerWorker, Role,
        Topology, WorkerHandle, WorkerSettings, WorkerState,
    },
};

/// One bridging queue and the worker serving it.
struct Registration<T, C> {
    bridge: Arc<BridgeQueue<T>>,
    worker: Arc<WorkerHandle<C>>,
}

impl<T, C> Clone for Registration<T, C> {
    fn clone(&self) -> Self {
        Self {
            bridge: self.bridge.clone(),
            worker: self.worker.clone(),
        }
    }
}

type Registry<T, C> = DashMap<String, Registration<T, C>>;

/// Snapshot of the registered exchanges per direction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Channels {
    pub consumer_channels: BTreeSet<String>,
    pub producer_channels: BTreeSet<String>,
}

pub struct Controller<B: Broker = AmqpBroker> {
    options: ControllerOptions,
    settings: WorkerSettings,
    serializer: Serializer,
    broker: Arc<B>,
    consumers: Registry<Envelope, ConsumerCommand>,
    producers: Registry<OutboundMessage, ProducerCommand>,
    closed: AtomicBool,
}

impl Controller<AmqpBroker> {
    /// Resolve the credentials of `options.profile` and build a controller
    /// connecting to that broker. No connection is made until first use.
    pub fn new(options: ControllerOptions) -> std::result::Result<Self, ConfigError> {
        let path = options.resolve_config_path()?;
        let credentials = Credentials::from_file(&path, &options.profile)?;
        info!(profile = %credentials.profile, host = %credentials.host, "loaded credentials");
        Ok(Self::with_broker(options, AmqpBroker::new(credentials)))
    }

    /// Like [`Controller::new`], but a configuration failure terminates the
    /// process with the failure's exit code.
    pub fn new_or_exit(options: ControllerOptions) -> Self {
        match Self::new(options) {
            Ok(controller) => controller,
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(err.exit_code());
            }
        }
    }
}

impl<B: Broker> Controller<B> {
    pub fn with_broker(options: ControllerOptions, broker: B) -> Self {
        Self {
            settings: WorkerSettings::from(&options),
            serializer: Serializer::from(&options),
            options,
            broker: Arc::new(broker),
            consumers: DashMap::new(),
            producers: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    /// Look up or atomically create the registration for `exchange`.
    ///
    /// Returns whether the registration was created by this call.
    fn register<T, W>(
        &self,
        registry: &Registry<T, W::Command>,
        exchange: &str,
        queue_suffix: Option<&str>,
        kind: ExchangeKind,
        build: impl FnOnce(Topology, Arc<BridgeQueue<T>>) -> W,
    ) -> Result<(Registration<T, W::Command>, bool)>
    where
        W: ChannelWorker<Broker = B>,
    {
        if let Some(registration) = registry.get(exchange) {
            return Ok((registration.clone(), false));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(CourierError::WorkerStopped {
                exchange: exchange.to_string(),
                role: W::ROLE.as_str(),
                reason: "the controller is closed".to_string(),
            });
        }

        match registry.entry(exchange.to_string()) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                let topology =
                    Topology::new(exchange, queue_suffix, &self.options.routing_key, kind)?;
                let bridge = Arc::new(BridgeQueue::new());
                let worker = build(topology.clone(), bridge.clone());
                let handle = WorkerHandle::spawn(worker, self.broker.clone(), &self.settings)?;
                info!(
                    exchange,
                    queue = %topology.queue,
                    kind = %topology.kind,
                    role = %W::ROLE,
                    "registered"
                );

                let registration = Registration {
                    bridge,
                    worker: Arc::new(handle),
                };
                entry.insert(registration.clone());
                Ok((registration, true))
            }
        }
    }

    fn producer(
        &self,
        exchange: &str,
        queue_suffix: Option<&str>,
        kind: ExchangeKind,
    ) -> Result<Registration<OutboundMessage, ProducerCommand>> {
        let settings = &self.settings;
        let (registration, _) = self.register(
            &self.producers,
            exchange,
            queue_suffix,
            kind,
            |topology, bridge| ProducerWorker::<B>::new(topology, bridge, settings),
        )?;
        Ok(registration)
    }

    fn consumer(
        &self,
        exchange: &str,
        queue_suffix: Option<&str>,
        kind: ExchangeKind,
    ) -> Result<Registration<Envelope, ConsumerCommand>> {
        let settings = &self.settings;
        let (registration, created) = self.register(
            &self.consumers,
            exchange,
            queue_suffix,
            kind,
            |topology, bridge| ConsumerWorker::<B>::new(topology, bridge, settings),
        )?;

        if created {
            // Readiness gate: give the first connection a chance to start
            // consuming before the caller polls the queue.
            let state = registration.worker.wait_for_state(
                |state| state != WorkerState::Starting,
                self.options.startup_timeout(),
            );
            if state == WorkerState::Starting {
                warn!(exchange, "consumer is not connected yet");
            }
        }
        Ok(registration)
    }

    /// Serialize `message` and queue it for publication on `exchange`.
    ///
    /// Returns once the message is queued; publication is asynchronous. The
    /// first call for an exchange must name a queue suffix. Messages that fail
    /// to publish are retried on the next connection. Only when the producer
    /// has stopped with messages it never published does this return
    /// [`CourierError::PublishFailed`], once; later calls return
    /// [`CourierError::WorkerStopped`].
    #[instrument(skip(self, message), level = "debug")]
    pub fn send<T: Serialize + ?Sized>(
        &self,
        message: &T,
        exchange: &str,
        queue_suffix: Option<&str>,
        kind: ExchangeKind,
    ) -> Result<()> {
        let registration = self.producer(exchange, queue_suffix, kind)?;
        if let Err(stopped) = registration.worker.ensure_running() {
            return match registration.worker.take_publish_failure() {
                Some((attempts, reason)) => Err(CourierError::PublishFailed {
                    exchange: exchange.to_string(),
                    attempts,
                    reason,
                }),
                None => Err(stopped),
            };
        }

        let body = self
            .serializer
            .to_bytes(message)
            .map_err(|err| CourierError::SerializationFailed {
                exchange: exchange.to_string(),
                reason: format!("{err:#}"),
            })?;

        registration
            .bridge
            .push(OutboundMessage::new(body, self.serializer));
        Ok(())
    }

    /// Take one envelope from `exchange`.
    ///
    /// With `block = false` this returns immediately; otherwise it waits up to
    /// `timeout`, or indefinitely when `timeout` is `None`. `Ok(None)` means
    /// nothing arrived in time. In auto-ack mode the envelope is acknowledged
    /// before it is returned.
    #[instrument(skip(self), level = "debug")]
    pub fn receive(
        &self,
        exchange: &str,
        queue_suffix: Option<&str>,
        block: bool,
        timeout: Option<Duration>,
        kind: ExchangeKind,
    ) -> Result<Option<Envelope>> {
        let registration = self.consumer(exchange, queue_suffix, kind)?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if registration.worker.state() == WorkerState::Stopped
                && registration.bridge.is_empty()
            {
                return Err(registration.worker.stopped_error());
            }

            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            // Wake up periodically so that a worker stopping mid-wait is noticed.
            let slice = match remaining {
                Some(remaining) => remaining.min(self.options.poll_interval()),
                None => self.options.poll_interval(),
            };

            let Some(envelope) = registration.bridge.pop(block, Some(slice)) else {
                let expired = remaining.map_or(false, |remaining| remaining <= slice);
                if !block || expired {
                    return Ok(None);
                }
                continue;
            };

            if !self.options.auto_ack {
                return Ok(Some(envelope));
            }
            match self.acknowledge_message(&envelope) {
                Ok(()) => return Ok(Some(envelope)),
                Err(CourierError::StaleDeliveryTag { tag, .. }) => {
                    // The broker redelivers it on the new channel.
                    debug!(exchange, tag, "skipping envelope from a replaced channel");
                    if !block {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drain `exchange` until one dequeue comes back empty within the batch
    /// timeout. The result is a snapshot: more messages may arrive right
    /// after.
    pub fn receive_batch(
        &self,
        exchange: &str,
        queue_suffix: Option<&str>,
        kind: ExchangeKind,
    ) -> Result<Vec<Envelope>> {
        let timeout = self.options.batch_timeout();
        let mut batch = Vec::new();
        while let Some(envelope) = self.receive(exchange, queue_suffix, true, Some(timeout), kind)? {
            batch.push(envelope);
        }
        debug!(exchange, count = batch.len(), "received batch");
        Ok(batch)
    }

    fn settle(&self, envelope: &Envelope, requeue: Option<bool>) -> Result<()> {
        let exchange = &envelope.origin;
        let registration = self
            .consumers
            .get(exchange)
            .map(|registration| registration.clone())
            .ok_or_else(|| CourierError::UnknownExchange(exchange.clone()))?;

        let (reply, response) = bounded(1);
        let command = match requeue {
            None => ConsumerCommand::Ack {
                delivery_tag: envelope.delivery_tag(),
                generation: envelope.generation,
                reply,
            },
            Some(requeue) => ConsumerCommand::Nack {
                delivery_tag: envelope.delivery_tag(),
                generation: envelope.generation,
                requeue,
                reply,
            },
        };
        registration.worker.send_command(command)?;

        let timeout = self.options.ack_timeout();
        match response.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CourierError::Timeout {
                exchange: exchange.clone(),
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(registration.worker.stopped_error()),
        }
    }

    /// Acknowledge `envelope` on the worker that delivered it.
    pub fn acknowledge_message(&self, envelope: &Envelope) -> Result<()> {
        self.settle(envelope, None)
    }

    /// Reject `envelope`. With `requeue` the broker delivers it again, with a
    /// new delivery tag.
    pub fn nack_message(&self, envelope: &Envelope, requeue: bool) -> Result<()> {
        self.settle(envelope, Some(requeue))
    }

    /// Wait until everything sent to `exchange` so far has been published.
    /// Returns the number of messages the producer has published.
    pub fn flush(&self, exchange: &str, timeout: Duration) -> Result<u64> {
        let registration = self
            .producers
            .get(exchange)
            .map(|registration| registration.clone())
            .ok_or_else(|| CourierError::UnknownExchange(exchange.to_string()))?;

        let (reply, response) = bounded(1);
        registration
            .worker
            .send_command(ProducerCommand::Flush { reply })?;
        match response.recv_timeout(timeout) {
            Ok(published) => Ok(published),
            Err(RecvTimeoutError::Timeout) => Err(CourierError::Timeout {
                exchange: exchange.to_string(),
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(registration.worker.stopped_error()),
        }
    }

    /// The state of the worker serving `exchange` in the given direction.
    pub fn worker_state(&self, exchange: &str, role: Role) -> Option<WorkerState> {
        match role {
            Role::Consumer => self.consumers.get(exchange).map(|r| r.worker.state()),
            Role::Producer => self.producers.get(exchange).map(|r| r.worker.state()),
        }
    }

    pub fn get_channels(&self) -> Channels {
        Channels {
            consumer_channels: self.consumers.iter().map(|r| r.key().clone()).collect(),
            producer_channels: self.producers.iter().map(|r| r.key().clone()).collect(),
        }
    }

    /// Stop every worker, producers first. A connected producer publishes
    /// what is still queued before closing; one waiting to reconnect drops it
    /// and logs how many messages were lost. Safe to call more than once.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let producers = drain(&self.producers);
        let consumers = drain(&self.consumers);
        if producers.is_empty() && consumers.is_empty() {
            return;
        }

        for registration in &producers {
            registration.worker.request_stop();
        }
        for registration in &consumers {
            registration.worker.request_stop();
        }
        let stopped = producers.iter().filter(|r| r.worker.stop()).count()
            + consumers.iter().filter(|r| r.worker.stop()).count();
        info!(
            stopped,
            total = producers.len() + consumers.len(),
            "controller closed"
        );
    }
}

fn drain<T, C>(registry: &Registry<T, C>) -> Vec<Registration<T, C>> {
    let keys: Vec<String> = registry.iter().map(|r| r.key().clone()).collect();
    keys.into_iter()
        .filter_map(|key| registry.remove(&key).map(|(_, registration)| registration))
        .collect()
}

impl<B: Broker> Drop for Controller<B> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs};

    use tempfile::TempDir;

    use super::*;
    use crate::{
        broker::{in_memory::InMemoryBroker, RawDelivery},
        config::EXIT_PROFILE_NOT_FOUND,
        logging::LogRegistry,
        message::{DeliveryMode, MessageProperties},
    };

    const WAIT: Duration = Duration::from_secs(5);
    const FANOUT: ExchangeKind = ExchangeKind::Fanout;

    fn options(dir: &TempDir) -> ControllerOptions {
        let mut options = ControllerOptions::new("test", dir.path().join("courier.log"));
        options.reconnect_wait_ms = 20;
        options.poll_interval_ms = 10;
        options.batch_timeout_ms = 200;
        options.shutdown_timeout_ms = 1000;
        options
    }

    fn manual_ack(dir: &TempDir) -> ControllerOptions {
        let mut options = options(dir);
        options.auto_ack = false;
        options
    }

    #[test]
    fn hello_world_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::with_broker(options(&dir), InMemoryBroker::new());

        controller
            .send("Hello, world!", "basic", Some("q"), FANOUT)
            .unwrap();
        let envelope = controller
            .receive("basic", Some("q"), true, Some(WAIT), FANOUT)
            .unwrap()
            .expect("a message");

        let text: String = envelope.decode().unwrap();
        assert_eq!(text, "Hello, world!");
        assert_eq!(envelope.delivery.exchange, "basic");
        assert_eq!(
            envelope.properties.content_type.as_deref(),
            Some("application/json")
        );
        assert_eq!(envelope.properties.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(envelope.properties.app_id.as_deref(), Some("test"));
    }

    #[test]
    fn batches_come_back_in_send_order() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::with_broker(options(&dir), InMemoryBroker::new());

        for payload in ["Hello, world!", "Hello, world!", "Goodbye"] {
            controller.send(payload, "basic", Some("q"), FANOUT).unwrap();
        }
        assert_eq!(controller.flush("basic", WAIT).unwrap(), 3);

        let batch = controller.receive_batch("basic", Some("q"), FANOUT).unwrap();
        let texts: Vec<String> = batch.iter().map(|e| e.decode().unwrap()).collect();
        assert_eq!(texts, vec!["Hello, world!", "Hello, world!", "Goodbye"]);

        assert!(controller
            .receive_batch("basic", None, FANOUT)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn first_use_requires_a_queue_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::with_broker(options(&dir), InMemoryBroker::new());

        assert!(matches!(
            controller.send("x", "basic", None, FANOUT),
            Err(CourierError::MissingQueueSuffix(_))
        ));
        assert!(matches!(
            controller.receive("basic", None, false, None, FANOUT),
            Err(CourierError::MissingQueueSuffix(_))
        ));
        assert!(matches!(
            controller.receive_batch("basic", Some(""), FANOUT),
            Err(CourierError::MissingQueueSuffix(_))
        ));
        assert_eq!(controller.get_channels(), Channels::default());

        controller.send("x", "basic", Some("q"), FANOUT).unwrap();
        controller.send("y", "basic", None, FANOUT).unwrap();
        assert_eq!(
            controller.get_channels().producer_channels,
            BTreeSet::from(["basic".to_string()])
        );
    }

    #[test]
    fn later_calls_keep_the_first_registration() {
        let dir = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::new();
        let controller = Controller::with_broker(options(&dir), broker.clone());

        controller.send("x", "basic", Some("q"), FANOUT).unwrap();
        controller
            .send("y", "basic", Some("other"), ExchangeKind::Topic)
            .unwrap();
        controller.flush("basic", WAIT).unwrap();

        assert_eq!(broker.ready_count("basic.q"), 2);
        assert_eq!(broker.ready_count("basic.other"), 0);
        assert_eq!(broker.exchange_kind("basic"), Some(FANOUT));
    }

    #[test]
    fn non_blocking_receive_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::with_broker(options(&dir), InMemoryBroker::new());

        assert!(controller
            .receive("idle", Some("q"), false, None, FANOUT)
            .unwrap()
            .is_none());

        let start = Instant::now();
        assert!(controller
            .receive("idle", Some("q"), false, None, FANOUT)
            .unwrap()
            .is_none());
        assert!(start.elapsed() < Duration::from_millis(100));

        let start = Instant::now();
        assert!(controller
            .receive("idle", Some("q"), true, Some(Duration::from_millis(50)), FANOUT)
            .unwrap()
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn nack_with_requeue_redelivers_once() {
        let dir = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::new();
        let controller = Controller::with_broker(manual_ack(&dir), broker.clone());

        controller.send("retry me", "jobs", Some("q"), FANOUT).unwrap();
        controller.flush("jobs", WAIT).unwrap();

        let first = controller
            .receive("jobs", Some("q"), true, Some(WAIT), FANOUT)
            .unwrap()
            .unwrap();
        controller.nack_message(&first, true).unwrap();

        let second = controller
            .receive("jobs", None, true, Some(WAIT), FANOUT)
            .unwrap()
            .unwrap();
        assert!(second.delivery.redelivered);
        assert_ne!(second.delivery_tag(), first.delivery_tag());
        assert_eq!(second.body, first.body);

        controller.acknowledge_message(&second).unwrap();
        assert_eq!(broker.unacked_count("jobs.q"), 0);
        assert_eq!(broker.ready_count("jobs.q"), 0);
        assert!(controller
            .receive("jobs", None, true, Some(Duration::from_millis(50)), FANOUT)
            .unwrap()
            .is_none());
    }

    #[test]
    fn acks_after_a_reconnect_are_stale() {
        let dir = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::new();
        let controller = Controller::with_broker(manual_ack(&dir), broker.clone());

        controller.send("survivor", "jobs", Some("q"), FANOUT).unwrap();
        controller.flush("jobs", WAIT).unwrap();
        let before = controller
            .receive("jobs", Some("q"), true, Some(WAIT), FANOUT)
            .unwrap()
            .unwrap();

        broker.sever_connections();
        let after = controller
            .receive("jobs", None, true, Some(WAIT), FANOUT)
            .unwrap()
            .unwrap();
        assert!(after.delivery.redelivered);
        assert_eq!(after.body, before.body);

        assert!(matches!(
            controller.acknowledge_message(&before),
            Err(CourierError::StaleDeliveryTag { .. })
        ));
        controller.acknowledge_message(&after).unwrap();
        assert_eq!(
            controller.worker_state("jobs", Role::Consumer),
            Some(WorkerState::Connected)
        );
    }

    #[test]
    fn disabled_reconnection_surfaces_a_stopped_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(&dir);
        options.reconnect_wait_ms = -1;
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        let controller = Controller::with_broker(options, broker);

        let result = controller.receive("jobs", Some("q"), true, Some(WAIT), FANOUT);
        assert!(matches!(
            result,
            Err(CourierError::WorkerStopped { role: "consumer", .. })
        ));
        assert_eq!(
            controller.worker_state("jobs", Role::Consumer),
            Some(WorkerState::Stopped)
        );
    }

    #[test]
    fn serialization_failures_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::with_broker(options(&dir), InMemoryBroker::new());

        let mut payload = HashMap::new();
        payload.insert((1, 2), "tuple keys are not JSON object keys");
        assert!(matches!(
            controller.send(&payload, "basic", Some("q"), FANOUT),
            Err(CourierError::SerializationFailed { exchange, .. }) if exchange == "basic"
        ));
        assert_eq!(controller.flush("basic", WAIT).unwrap(), 0);
    }

    #[test]
    fn settling_requires_a_registered_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::with_broker(manual_ack(&dir), InMemoryBroker::new());
        let envelope = Envelope::new(
            "nowhere",
            1,
            RawDelivery {
                exchange: "nowhere".into(),
                routing_key: String::new(),
                delivery_tag: 1,
                redelivered: false,
                properties: MessageProperties::default(),
                body: Default::default(),
            },
        );
        assert!(matches!(
            controller.acknowledge_message(&envelope),
            Err(CourierError::UnknownExchange(exchange)) if exchange == "nowhere"
        ));
        assert!(matches!(
            controller.flush("nowhere", WAIT),
            Err(CourierError::UnknownExchange(_))
        ));
    }

    #[test]
    fn close_stops_everything_and_releases_logs() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(&dir);
        let log_file = options.log_file.clone();
        let broker = InMemoryBroker::new();
        let controller = Controller::with_broker(options, broker.clone());

        controller.send("queued", "out", Some("q"), FANOUT).unwrap();
        controller
            .receive("in", Some("q"), false, None, FANOUT)
            .unwrap();
        let deadline = Instant::now() + WAIT;
        while controller.worker_state("out", Role::Producer) != Some(WorkerState::Connected) {
            assert!(Instant::now() < deadline, "producer never connected");
            std::thread::sleep(Duration::from_millis(5));
        }
        let channels = controller.get_channels();
        assert_eq!(channels.producer_channels, BTreeSet::from(["out".to_string()]));
        assert_eq!(channels.consumer_channels, BTreeSet::from(["in".to_string()]));

        controller.close();
        controller.close();
        assert_eq!(controller.get_channels(), Channels::default());
        assert_eq!(broker.ready_count("out.q"), 1);
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(LogRegistry::global().ref_count("out", &log_file), 0);
        assert_eq!(LogRegistry::global().ref_count("in", &log_file), 0);
        assert!(fs::read_to_string(&log_file).unwrap().contains("connected"));

        assert!(matches!(
            controller.send("late", "out", Some("q"), FANOUT),
            Err(CourierError::WorkerStopped { .. })
        ));
    }

    #[test]
    fn concurrent_first_use_starts_one_worker_per_direction() {
        let dir = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::new();
        let controller = Controller::with_broker(options(&dir), broker.clone());

        std::thread::scope(|scope| {
            for i in 0..16 {
                let controller = &controller;
                scope.spawn(move || {
                    if i % 2 == 0 {
                        controller.send("race", "shared", Some("q"), FANOUT).unwrap();
                    } else {
                        controller
                            .receive("shared", Some("q"), false, None, FANOUT)
                            .unwrap();
                    }
                });
            }
        });

        controller.flush("shared", WAIT).unwrap();
        let deadline = Instant::now() + WAIT;
        while controller.worker_state("shared", Role::Consumer) != Some(WorkerState::Connected) {
            assert!(Instant::now() < deadline, "consumer never connected");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(broker.open_connections(), 2);
        assert_eq!(broker.consumer_count("shared.q"), 1);
        let channels = controller.get_channels();
        assert_eq!(channels.producer_channels, BTreeSet::from(["shared".to_string()]));
        assert_eq!(channels.consumer_channels, BTreeSet::from(["shared".to_string()]));
    }

    #[test]
    fn missing_profiles_map_to_exit_code_two() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("courier.json");
        fs::write(&config, r#"{"version": "0.1", "profiles": {}}"#).unwrap();

        let mut options = options(&dir);
        options.config_path = Some(config);
        match Controller::new(options) {
            Err(err) => assert_eq!(err.exit_code(), EXIT_PROFILE_NOT_FOUND),
            Ok(_) => panic!("the profile does not exist"),
        }
    }
}
