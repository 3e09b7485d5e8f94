//! An in-process broker with AMQP acknowledgement semantics.
//!
//! Useful for exercising workers and the controller without a live broker.
//! The emulation covers what workers rely on:
//! - exchange routing (fanout, direct, topic; headers exchanges route like
//!   fanout since binding arguments are not modelled),
//! - per-channel delivery tags, prefetch limits and manual acknowledgement,
//! - requeue on nack and on channel close, with the `redelivered` flag set,
//! - mandatory publishes reported as [`PublishStatus::Unroutable`].
//!
//! Faults are injected with [`InMemoryBroker::sever_connections`] and
//! [`InMemoryBroker::set_online`].
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use super::{Broker, Channel, Connection, PublishStatus, RawDelivery};
use crate::{config::ExchangeKind, message::MessageProperties};

#[derive(Clone, Debug)]
struct Message {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    body: Bytes,
}

struct Subscription {
    channel: u64,
    tag: String,
    sender: UnboundedSender<Result<RawDelivery>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    subscriptions: Vec<Subscription>,
    next_subscription: usize,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

/// An open channel. Closed channels are removed from the broker.
struct ChannelState {
    connection: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Message)>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

struct State {
    online: bool,
    next_id: u64,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    /// Open connections only.
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            online: true,
            next_id: 0,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            connections: HashSet::new(),
            channels: HashMap::new(),
        }
    }
}

/// Does `routing_key` match the topic binding `pattern`?
///
/// `*` matches exactly one dot-separated word, `#` matches zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<_> = pattern.split('.').collect();
    let key: Vec<_> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel(&mut self, id: u64) -> Result<&mut ChannelState> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| anyhow!("channel {id} is closed"))
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| anyhow!("NOT_FOUND - no exchange '{exchange}'"))?;

        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .filter(|binding| match kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            })
            .map(|binding| binding.queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        Ok(queues)
    }

    fn enqueue(&mut self, queue: &str, message: Message) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_back(message);
        }
        self.dispatch(queue);
    }

    /// Hand ready messages to subscribers, round-robin, within prefetch limits.
    fn dispatch(&mut self, queue: &str) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        state
            .subscriptions
            .retain(|subscription| !subscription.sender.is_closed());

        while !state.ready.is_empty() && !state.subscriptions.is_empty() {
            let count = state.subscriptions.len();
            let start = state.next_subscription % count;
            let chosen = (0..count).map(|i| (start + i) % count).find(|&i| {
                self.channels
                    .get(&state.subscriptions[i].channel)
                    .map_or(false, ChannelState::has_capacity)
            });
            let Some(index) = chosen else {
                break;
            };
            state.next_subscription = index + 1;

            let Some(message) = state.ready.pop_front() else {
                break;
            };
            let subscription = &state.subscriptions[index];
            let Some(channel) = self.channels.get_mut(&subscription.channel) else {
                break;
            };
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;

            let delivery = RawDelivery {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                delivery_tag,
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };
            channel
                .unacked
                .insert(delivery_tag, (queue.to_string(), message));
            trace!(queue, delivery_tag, "dispatched");
            let _ = subscription.sender.unbounded_send(Ok(delivery));
        }
    }

    /// Return a message to the head of its queue, marked as redelivered.
    fn requeue_front(&mut self, queue: &str, mut message: Message) {
        message.redelivered = true;
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_front(message);
        }
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };

        let mut touched: Vec<String> = Vec::new();
        for (queue, message) in channel.unacked.into_values().rev() {
            self.requeue_front(&queue, message);
            touched.push(queue);
        }
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.subscriptions.len();
            queue
                .subscriptions
                .retain(|subscription| subscription.channel != id);
            if queue.subscriptions.len() != before {
                touched.push(name.clone());
            }
        }

        touched.sort();
        touched.dedup();
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, id: u64) {
        self.connections.remove(&id);
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == id)
            .map(|(&channel, _)| channel)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
    }
}

/// A broker living entirely in this process.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every open connection, as a network partition would. Unacked
    /// deliveries go back to their queues.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let connections: Vec<u64> = state.connections.iter().copied().collect();
        for id in connections {
            state.close_connection(id);
        }
    }

    /// Take the broker offline (severing all connections and refusing new
    /// ones) or bring it back.
    pub fn set_online(&self, online: bool) {
        if !online {
            self.sever_connections();
        }
        self.lock().online = online;
    }

    /// Publish a message without going through a connection.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
        properties: MessageProperties,
    ) -> Result<PublishStatus> {
        let mut state = self.lock();
        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
            properties,
            body: body.into(),
        };
        publish(&mut state, message)
    }

    /// Number of messages waiting in `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Number of messages from `queue` delivered but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|(name, _)| name == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.subscriptions.len())
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).copied()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Number of open channels across all connections.
    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }
}

fn publish(state: &mut State, message: Message) -> Result<PublishStatus> {
    let queues = state.route(&message.exchange, &message.routing_key)?;
    if queues.is_empty() {
        return Ok(PublishStatus::Unroutable);
    }
    for queue in queues {
        state.enqueue(&queue, message.clone());
    }
    Ok(PublishStatus::Confirmed)
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> Result<InMemoryConnection> {
        let mut state = self.lock();
        if !state.online {
            bail!("connection refused: broker is offline");
        }
        let id = state.id();
        state.connections.insert(id);
        Ok(InMemoryConnection {
            broker: self.clone(),
            id,
        })
    }
}

pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl Connection for InMemoryConnection {
    type Channel = InMemoryChannel;

    async fn open_channel(&self) -> Result<InMemoryChannel> {
        let mut state = self.broker.lock();
        if !state.connections.contains(&self.id) {
            bail!("connection {} is closed", self.id);
        }
        let id = state.id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        })
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_connection(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.lock().connections.contains(&self.id)
    }
}

pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

impl InMemoryChannel {
    /// Run `f` against an open channel. An error closes the channel, as the
    /// broker does for channel-level exceptions.
    fn with_open<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        let result = f(&mut state);
        if result.is_err() {
            state.close_channel(self.id);
        }
        result
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    type Deliveries = UnboundedReceiver<Result<RawDelivery>>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.with_open(|state| match state.exchanges.get(name) {
            Some(existing) if *existing != kind => bail!(
                "PRECONDITION_FAILED - exchange '{name}' is declared as {existing}, not {kind}"
            ),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        })
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.with_open(|state| {
            state.queues.entry(name.to_string()).or_default();
            Ok(())
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.with_open(|state| {
            if !state.queues.contains_key(queue) {
                bail!("NOT_FOUND - no queue '{queue}'");
            }
            if !state.exchanges.contains_key(exchange) {
                bail!("NOT_FOUND - no exchange '{exchange}'");
            }
            let exists = state.bindings.iter().any(|binding| {
                binding.queue == queue
                    && binding.exchange == exchange
                    && binding.routing_key == routing_key
            });
            if !exists {
                state.bindings.push(Binding {
                    queue: queue.to_string(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            Ok(())
        })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.with_open(|state| {
            state.channel(self.id)?.prefetch = prefetch_count;
            Ok(())
        })
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.with_open(|_| Ok(()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishStatus> {
        self.with_open(|state| {
            publish(
                state,
                Message {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    properties: properties.clone(),
                    body: Bytes::copy_from_slice(body),
                },
            )
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Self::Deliveries> {
        self.with_open(|state| {
            let id = self.id;
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| anyhow!("NOT_FOUND - no queue '{queue}'"))?;
            if queue_state
                .subscriptions
                .iter()
                .any(|s| s.channel == id && s.tag == consumer_tag)
            {
                bail!("NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'");
            }

            let (sender, receiver) = mpsc::unbounded();
            queue_state.subscriptions.push(Subscription {
                channel: id,
                tag: consumer_tag.to_string(),
                sender,
            });
            state.dispatch(queue);
            Ok(receiver)
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.with_open(|state| {
            let id = self.id;
            for queue in state.queues.values_mut() {
                queue
                    .subscriptions
                    .retain(|s| !(s.channel == id && s.tag == consumer_tag));
            }
            Ok(())
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.with_open(|state| {
            let (queue, _) = state
                .channel(self.id)?
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| anyhow!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))?;
            state.dispatch(&queue);
            Ok(())
        })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.with_open(|state| {
            let (queue, message) = state
                .channel(self.id)?
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| anyhow!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))?;
            if requeue {
                state.requeue_front(&queue, message);
            }
            state.dispatch(&queue);
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        let state = self.broker.lock();
        let Some(channel) = state.channels.get(&self.id) else {
            return false;
        };
        state.connections.contains(&channel.connection)
    }
}
