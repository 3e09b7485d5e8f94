//! Per-exchange background workers.
//!
//! A worker owns one broker connection and one channel for a single
//! [`Topology`], and runs on a dedicated thread with its own single-threaded
//! tokio runtime. Nothing outside that thread ever touches the connection or
//! the channel: callers talk to a worker through its bridging queue and
//! through commands sent over an unbounded channel into the worker's event
//! loop.
//!
//! # Lifecycle
//!
//! ```text
//!             ┌──────────────────────────────────────────┐
//!             v                                          │
//!  Starting ──connect, declare, on_ready──> Connected    │ delay elapsed
//!     │                                        │         │
//!     │ error                           error  │         │
//!     └──────────────┬─────────────────────────┘         │
//!                    v                                   │
//!      reconnection enabled? ──yes──> ReconnectWait ─────┘
//!                    │ no
//!                    v
//!                 Stopped <── Stopping <── stop() from any thread
//! ```
//!
//! [`supervise`] drives the loop. [`ChannelWorker`] is the capability the two
//! variants, [`ConsumerWorker`] and [`ProducerWorker`], implement.
use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Level};

use crate::{
    broker::{Broker, Channel, ChannelOf, Connection, ConnectionOf},
    config::{ControllerOptions, ExchangeKind, ReconnectPolicy},
    error::CourierError,
    logging::LogRegistry,
};

pub mod consumer;
pub mod producer;

pub use consumer::{ConsumerCommand, ConsumerWorker};
pub use producer::{ProducerCommand, ProducerWorker};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The broker objects a worker declares: a durable exchange and a durable
/// queue named `<exchange>.<suffix>` bound to it with a routing key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub kind: ExchangeKind,
}

impl Topology {
    /// Fails with [`CourierError::MissingQueueSuffix`] when no (or an empty)
    /// suffix is given.
    pub fn new(
        exchange: &str,
        queue_suffix: Option<&str>,
        routing_key: &str,
        kind: ExchangeKind,
    ) -> Result<Self, CourierError> {
        let suffix = queue_suffix
            .filter(|suffix| !suffix.is_empty())
            .ok_or_else(|| CourierError::MissingQueueSuffix(exchange.to_string()))?;

        Ok(Self {
            exchange: exchange.to_string(),
            queue: format!("{exchange}.{suffix}"),
            routing_key: routing_key.to_string(),
            kind,
        })
    }
}

/// The direction a worker moves messages in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Consumer,
    Producer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consumer => "consumer",
            Self::Producer => "producer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Connecting and declaring the topology.
    Starting,
    Connected,
    /// Sleeping before the next connection attempt.
    ReconnectWait,
    /// A stop was requested; the worker is closing its channel.
    Stopping,
    /// The worker thread has exited or is about to.
    Stopped,
}

/// Settings shared by every worker a controller starts.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub reconnect: ReconnectPolicy,
    pub poll_interval: Duration,
    pub prefetch_count: u16,
    pub publish_attempts: u32,
    /// Sender identity stamped on published messages.
    pub app_id: String,
    pub shutdown_timeout: Duration,
    pub log_file: PathBuf,
    pub log_level: Level,
}

impl From<&ControllerOptions> for WorkerSettings {
    fn from(options: &ControllerOptions) -> Self {
        Self {
            reconnect: options.reconnect_policy(),
            poll_interval: options.poll_interval(),
            prefetch_count: options.prefetch_count,
            publish_attempts: options.publish_attempts.max(1),
            app_id: options.profile.clone(),
            shutdown_timeout: options.shutdown_timeout(),
            log_file: options.log_file.clone(),
            log_level: options.log_level,
        }
    }
}

/// State shared between a worker thread and its [`WorkerHandle`].
#[derive(Debug)]
pub struct WorkerShared {
    state: Mutex<WorkerState>,
    changed: Condvar,
    generation: AtomicU64,
    published: AtomicU64,
    terminal_reason: Mutex<Option<String>>,
    publish_failure: Mutex<Option<(u32, String)>>,
}

impl Default for WorkerShared {
    fn default() -> Self {
        Self {
            state: Mutex::new(WorkerState::Starting),
            changed: Condvar::new(),
            generation: AtomicU64::new(0),
            published: AtomicU64::new(0),
            terminal_reason: Mutex::new(None),
            publish_failure: Mutex::new(None),
        }
    }
}

impl WorkerShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    /// `Stopped` is terminal, and once `Stopping` the only way out is
    /// `Stopped`.
    fn set_state(&self, next: WorkerState) {
        let mut state = lock(&self.state);
        let allowed = match *state {
            WorkerState::Stopped => false,
            WorkerState::Stopping => next == WorkerState::Stopped,
            _ => true,
        };
        if allowed && *state != next {
            debug!(from = ?*state, to = ?next, "worker state");
            *state = next;
            self.changed.notify_all();
        }
    }

    /// Block until `ready` holds or `timeout` elapses, returning the last
    /// observed state.
    pub fn wait_for(&self, ready: impl Fn(WorkerState) -> bool, timeout: Duration) -> WorkerState {
        let state = lock(&self.state);
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |state| !ready(*state))
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The number of channels this worker has opened so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn record_published(&self) -> u64 {
        self.published.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub(crate) fn record_publish_failure(&self, attempts: u32, reason: String) {
        *lock(&self.publish_failure) = Some((attempts, reason));
    }

    /// The last publish that exhausted its attempts, if it has not been
    /// reported yet.
    pub fn take_publish_failure(&self) -> Option<(u32, String)> {
        lock(&self.publish_failure).take()
    }

    fn terminate(&self, reason: String) {
        lock(&self.terminal_reason).get_or_insert(reason);
    }

    /// Why the worker stopped on its own, if it did.
    pub fn terminal_reason(&self) -> Option<String> {
        lock(&self.terminal_reason).clone()
    }
}

/// Marks the worker stopped when the thread exits, however it exits.
struct StoppedOnExit(Arc<WorkerShared>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.terminate("worker thread panicked".to_string());
        }
        self.0.set_state(WorkerState::Stopped);
    }
}

/// One of the two worker variants.
///
/// Every method runs on the worker's own thread. Methods returning `Err`
/// report a connection-level failure, which sends the worker through the
/// reconnect loop.
#[async_trait]
pub trait ChannelWorker: Send + 'static {
    type Broker: Broker;
    type Command: Send + 'static;

    const ROLE: Role;

    fn topology(&self) -> &Topology;

    fn shared(&self) -> &Arc<WorkerShared>;

    async fn connect(
        &mut self,
        broker: &Self::Broker,
    ) -> Result<(ConnectionOf<Self::Broker>, ChannelOf<Self::Broker>)> {
        let connection = broker.connect().await?;
        let channel = connection.open_channel().await?;
        Ok((connection, channel))
    }

    async fn declare_topology(&mut self, channel: &ChannelOf<Self::Broker>) -> Result<()> {
        let topology = self.topology().clone();
        channel
            .declare_exchange(&topology.exchange, topology.kind)
            .await?;
        channel.declare_queue(&topology.queue).await?;
        channel
            .bind_queue(&topology.queue, &topology.exchange, &topology.routing_key)
            .await?;
        Ok(())
    }

    /// Called once the topology is declared on a fresh channel.
    async fn on_ready(&mut self, channel: &ChannelOf<Self::Broker>, generation: u64) -> Result<()>;

    /// Serve the channel until `token` is cancelled (`Ok`) or the channel
    /// fails (`Err`).
    async fn run(
        &mut self,
        channel: &ChannelOf<Self::Broker>,
        commands: &mut UnboundedReceiver<Self::Command>,
        token: &CancellationToken,
    ) -> Result<()>;

    /// Stop consuming or publishing, ahead of closing the channel.
    async fn stop(&mut self, channel: &ChannelOf<Self::Broker>) -> Result<()>;

    /// Handle a command received while no channel is open.
    fn handle_offline(&mut self, command: Self::Command);

    /// Called once after the last session, before the worker is marked
    /// stopped. Work still pending at this point is lost.
    fn on_stopped(&mut self) {}
}

/// Run one connection: connect, declare, serve, then close on this thread.
async fn session<W: ChannelWorker>(
    worker: &mut W,
    broker: &W::Broker,
    settings: &WorkerSettings,
    commands: &mut UnboundedReceiver<W::Command>,
    token: &CancellationToken,
) -> Result<()> {
    let shared = worker.shared().clone();
    shared.set_state(WorkerState::Starting);

    let (connection, channel) = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        connected = worker.connect(broker) => connected?,
    };
    let generation = shared.next_generation();

    let mut outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Ok(()),
        ready = async {
            worker.declare_topology(&channel).await?;
            worker.on_ready(&channel, generation).await
        } => ready,
    };

    if outcome.is_ok() && !token.is_cancelled() {
        shared.set_state(WorkerState::Connected);
        info!(generation, queue = %worker.topology().queue, "connected");
        outcome = worker.run(&channel, commands, token).await;
    }

    if token.is_cancelled() {
        shared.set_state(WorkerState::Stopping);
    }

    let shutdown = async {
        if channel.is_open() {
            if let Err(err) = worker.stop(&channel).await {
                warn!(error = %err, "failed to stop cleanly");
            }
            if let Err(err) = channel.close().await {
                debug!(error = %err, "failed to close channel");
            }
        }
        if let Err(err) = connection.close().await {
            debug!(error = %err, "failed to close connection");
        }
    };
    if tokio::time::timeout(settings.shutdown_timeout, shutdown)
        .await
        .is_err()
    {
        warn!(timeout = ?settings.shutdown_timeout, "closing the connection timed out");
    }

    outcome
}

/// The reconnect loop. Returns once the worker is stopped.
pub(crate) async fn supervise<W: ChannelWorker>(
    mut worker: W,
    broker: Arc<W::Broker>,
    settings: WorkerSettings,
    mut commands: UnboundedReceiver<W::Command>,
    token: CancellationToken,
) {
    let shared = worker.shared().clone();

    'reconnect: loop {
        let outcome = session(&mut worker, &broker, &settings, &mut commands, &token).await;
        if token.is_cancelled() {
            break;
        }

        let err = outcome
            .err()
            .unwrap_or_else(|| anyhow!("the session ended unexpectedly"));
        warn!(error = %format!("{err:#}"), "connection lost");

        let Some(delay) = settings.reconnect.delay() else {
            error!("reconnection is disabled, stopping");
            shared.terminate(format!("{err:#}"));
            break;
        };

        shared.set_state(WorkerState::ReconnectWait);
        debug!(?delay, "waiting before reconnecting");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break 'reconnect,
                _ = &mut sleep => break,
                Some(command) = commands.recv() => worker.handle_offline(command),
            }
        }
    }

    worker.on_stopped();
    shared.set_state(WorkerState::Stopped);
    info!("stopped");
}

/// A handle to a running worker thread.
///
/// Dropping the handle requests a stop without waiting for it.
pub struct WorkerHandle<C> {
    exchange: String,
    role: Role,
    shared: Arc<WorkerShared>,
    commands: UnboundedSender<C>,
    token: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl<C: Send + 'static> WorkerHandle<C> {
    /// Start `worker` on a new thread named after its exchange and role.
    ///
    /// The log sink is acquired here so that an unusable log file is reported
    /// to the caller; the guard then moves into the thread and is released
    /// when the thread exits.
    pub fn spawn<W>(
        worker: W,
        broker: Arc<W::Broker>,
        settings: &WorkerSettings,
    ) -> Result<Self, CourierError>
    where
        W: ChannelWorker<Command = C>,
    {
        let topology = worker.topology().clone();
        let exchange = topology.exchange.clone();
        let shared = worker.shared().clone();
        let log_guard = LogRegistry::global()
            .acquire(&topology.exchange, &settings.log_file)
            .map_err(|source| CourierError::LogSink {
                path: settings.log_file.clone(),
                source,
            })?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let thread = std::thread::Builder::new()
            .name(format!("courier-{}-{}", W::ROLE, topology.exchange))
            .spawn({
                let shared = shared.clone();
                let token = token.clone();
                let settings = settings.clone();
                move || {
                    let _stopped = StoppedOnExit(shared.clone());
                    let subscriber = log_guard.subscriber(settings.log_level);
                    let _default = tracing::subscriber::set_default(subscriber);

                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            error!(error = %err, "failed to build the worker runtime");
                            shared.terminate(format!("failed to build the worker runtime: {err}"));
                            return;
                        }
                    };

                    let span = info_span!(
                        "worker",
                        exchange = %topology.exchange,
                        role = %W::ROLE
                    );
                    runtime.block_on(
                        supervise(worker, broker, settings, receiver, token).instrument(span),
                    );
                    drop(log_guard);
                }
            })
            .map_err(CourierError::Spawn)?;

        Ok(Self {
            exchange,
            role: W::ROLE,
            shared,
            commands,
            token,
            thread: Mutex::new(Some(thread)),
            shutdown_timeout: settings.shutdown_timeout,
        })
    }
}

impl<C> WorkerHandle<C> {
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Block until the worker reaches a state satisfying `ready`, or until
    /// `timeout` elapses. Returns the last observed state.
    pub fn wait_for_state(
        &self,
        ready: impl Fn(WorkerState) -> bool,
        timeout: Duration,
    ) -> WorkerState {
        self.shared.wait_for(ready, timeout)
    }

    /// Messages published so far. Always zero for consumers.
    pub fn published(&self) -> u64 {
        self.shared.published()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation()
    }

    pub fn take_publish_failure(&self) -> Option<(u32, String)> {
        self.shared.take_publish_failure()
    }

    pub fn stopped_error(&self) -> CourierError {
        CourierError::WorkerStopped {
            exchange: self.exchange.clone(),
            role: self.role.as_str(),
            reason: self
                .shared
                .terminal_reason()
                .unwrap_or_else(|| "the worker was stopped".to_string()),
        }
    }

    pub fn ensure_running(&self) -> Result<(), CourierError> {
        match self.state() {
            WorkerState::Stopping | WorkerState::Stopped => Err(self.stopped_error()),
            _ => Ok(()),
        }
    }

    /// Submit a command to the worker's event loop.
    pub fn send_command(&self, command: C) -> Result<(), CourierError> {
        self.ensure_running()?;
        self.commands
            .send(command)
            .map_err(|_| self.stopped_error())
    }

    /// Ask the worker to stop without waiting for it.
    pub fn request_stop(&self) {
        self.shared.set_state(WorkerState::Stopping);
        self.token.cancel();
    }

    /// Stop the worker and wait, bounded by the shutdown timeout, for its
    /// thread to exit. Returns whether it did. Calling it again is harmless.
    pub fn stop(&self) -> bool {
        self.request_stop();
        let state = self.shared.wait_for(
            |state| state == WorkerState::Stopped,
            self.shutdown_timeout.saturating_mul(2),
        );
        if state != WorkerState::Stopped {
            warn!(
                exchange = %self.exchange,
                role = %self.role,
                "worker did not stop in time, detaching it"
            );
            return false;
        }

        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                warn!(exchange = %self.exchange, role = %self.role, "worker thread panicked");
            }
        }
        true
    }
}

impl<C> Drop for WorkerHandle<C> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
