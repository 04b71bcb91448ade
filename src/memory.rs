// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process broker implementing the broker contract with the AMQP
//! semantics the consumption layer relies on:
//!
//! - direct, fanout and topic exchanges plus the default `""` exchange
//! - idempotent declarations; incompatible redeclarations are rejected
//! - exclusive queues owned by one connection and removed when it closes
//! - auto-delete queues removed when their last consumer goes away
//! - per-channel prefetch windows
//! - `nack(requeue = true)` puts the message back at the head of its queue
//!   flagged as redelivered
//! - `nack(requeue = false)` routes the message through the queue's
//!   `x-dead-letter-exchange`, or drops it when there is none
//! - closing a channel requeues everything it had not acknowledged
//!
//! Useful for tests and single-process deployments. Nothing is persisted.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, Delivery, DeliveryStream, Headers, OutboundMessage,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition, QueueHandle},
    topology::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::types::{AMQPValue, LongString, ShortString};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Header recording why a message was dead-lettered
pub const AMQP_HEADERS_FIRST_DEATH_REASON: &str = "x-first-death-reason";
/// Header recording the queue a message was dead-lettered from
pub const AMQP_HEADERS_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";

const DEFAULT_EXCHANGE: &str = "";

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Headers,
    /// `(exchange, routing key)` pairs, in bind order.
    pub bindings: Vec<(String, String)>,
    /// Bodies waiting to be delivered, head first.
    pub ready: Vec<Vec<u8>>,
    /// Deliveries pushed to consumers and not yet settled.
    pub unacked: usize,
    pub consumers: usize,
}

impl QueueSnapshot {
    /// Returns the `x-dead-letter-exchange` argument the queue was declared with.
    pub fn dead_letter_exchange(&self) -> Option<String> {
        match self
            .arguments
            .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE))
        {
            Some(AMQPValue::LongString(value)) => Some(long_string(value)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    content_type: Option<String>,
    headers: Headers,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct ExchangeEntry {
    def: ExchangeDefinition,
}

#[derive(Debug)]
struct QueueEntry {
    def: QueueDefinition,
    owner: Option<u64>,
    bindings: Vec<(String, String)>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<(u64, String)>,
    next_consumer: usize,
}

struct ConsumerEntry {
    tag: String,
    queue: String,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct ChannelEntry {
    connection: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    consumers: Vec<ConsumerEntry>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    channels: HashMap<u64, ChannelEntry>,
    connections: HashSet<u64>,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel(&mut self, id: u64) -> Result<&mut ChannelEntry, AmqpError> {
        self.channels.get_mut(&id).ok_or(AmqpError::ChannelError)
    }

    fn declare_exchange(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if def.name().is_empty() || def.name().starts_with("amq.") {
            return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
        }

        match self.exchanges.get(def.name()) {
            Some(existing) if existing.def != *def => {
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                self.exchanges
                    .insert(def.name().to_owned(), ExchangeEntry { def: def.clone() });
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, connection: u64, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        if def.name().is_empty() {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        if let Some(existing) = self.queues.get(def.name()) {
            let locked = existing.owner.is_some_and(|owner| owner != connection);
            if locked || existing.def != *def {
                return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
            }

            return Ok(handle_of(existing));
        }

        let entry = QueueEntry {
            def: def.clone(),
            owner: def.is_exclusive().then_some(connection),
            bindings: vec![],
            ready: VecDeque::new(),
            consumers: vec![],
            next_consumer: 0,
        };
        let handle = handle_of(&entry);
        self.queues.insert(def.name().to_owned(), entry);

        Ok(handle)
    }

    fn bind_queue(&mut self, connection: u64, binding: &QueueBinding) -> Result<(), AmqpError> {
        let err = || {
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            )
        };

        if !self.exchanges.contains_key(binding.exchange_name()) {
            return Err(err());
        }

        let queue = self.queues.get_mut(binding.queue_name()).ok_or_else(err)?;
        if queue.owner.is_some_and(|owner| owner != connection) {
            return Err(err());
        }

        let pair = (
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
        );
        if !queue.bindings.contains(&pair) {
            queue.bindings.push(pair);
        }

        Ok(())
    }

    fn consume(
        &mut self,
        channel_id: u64,
        queue_name: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::UnboundedReceiver<Result<Delivery, AmqpError>>, AmqpError> {
        let connection = self.channel(channel_id)?.connection;

        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| AmqpError::BindingConsumerError(queue_name.to_owned()))?;
        if queue.owner.is_some_and(|owner| owner != connection) {
            return Err(AmqpError::BindingConsumerError(queue_name.to_owned()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queue.consumers.push((channel_id, consumer_tag.to_owned()));

        self.channel(channel_id)?.consumers.push(ConsumerEntry {
            tag: consumer_tag.to_owned(),
            queue: queue_name.to_owned(),
            sender,
        });

        self.dispatch(queue_name);
        Ok(receiver)
    }

    /// Routes a message and returns the queues it landed in.
    fn route(&mut self, exchange: &str, routing_key: &str, msg: StoredMessage) -> Result<Vec<String>, AmqpError> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect()
        } else {
            let kind = self
                .exchanges
                .get(exchange)
                .map(|entry| entry.def.exchange_kind())
                .ok_or(AmqpError::PublishingError)?;

            let mut targets: Vec<String> = self
                .queues
                .iter()
                .filter(|(_, queue)| {
                    queue.bindings.iter().any(|(bound, key)| {
                        bound == exchange && binding_matches(kind, key, routing_key)
                    })
                })
                .map(|(name, _)| name.clone())
                .collect();
            targets.sort();
            targets
        };

        if targets.is_empty() {
            debug!(
                "unroutable message dropped - exchange: {} - routing key: {}",
                exchange, routing_key
            );
        }

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(msg.clone());
            }
            self.dispatch(name);
        }

        Ok(targets)
    }

    /// Pushes ready messages to consumers with room in their prefetch window.
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let mut chosen = None;

            for offset in 0..count {
                let idx = (queue.next_consumer + offset) % count;
                let (channel_id, _) = &queue.consumers[idx];
                let has_room = self.channels.get(channel_id).is_some_and(|channel| {
                    channel.prefetch == 0 || channel.unacked.len() < channel.prefetch as usize
                });
                if has_room {
                    chosen = Some(idx);
                    break;
                }
            }

            let Some(idx) = chosen else {
                break;
            };
            queue.next_consumer = (idx + 1) % count;

            let (channel_id, consumer_tag) = queue.consumers[idx].clone();
            let Some(channel) = self.channels.get_mut(&channel_id) else {
                queue.consumers.remove(idx);
                continue;
            };
            let Some(msg) = queue.ready.pop_front() else {
                break;
            };

            channel.next_tag += 1;
            let tag = channel.next_tag;

            let delivery = Delivery {
                delivery_tag: tag,
                redelivered: msg.redelivered,
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                content_type: msg.content_type.clone(),
                headers: msg.headers.clone(),
                body: msg.body.clone(),
            };

            let sent = channel
                .consumers
                .iter()
                .find(|consumer| consumer.tag == consumer_tag)
                .is_some_and(|consumer| consumer.sender.send(Ok(delivery)).is_ok());

            if sent {
                channel.unacked.insert(tag, (queue_name.to_owned(), msg));
            } else {
                // receiver gone: forget the consumer and keep the message
                channel.consumers.retain(|consumer| consumer.tag != consumer_tag);
                queue.consumers.remove(idx);
                queue.next_consumer = 0;
                queue.ready.push_front(msg);
            }
        }
    }

    fn settle(&mut self, channel_id: u64, tag: u64, requeue: Option<bool>) -> Result<(), AmqpError> {
        let failure = match requeue {
            None => AmqpError::AckMessageError,
            Some(_) => AmqpError::NackMessageError,
        };

        let channel = self.channels.get_mut(&channel_id).ok_or(failure.clone())?;
        let (queue_name, mut msg) = channel.unacked.remove(&tag).ok_or(failure)?;

        match requeue {
            None => {}
            Some(true) => {
                msg.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&queue_name) {
                    queue.ready.push_front(msg);
                }
            }
            Some(false) => self.dead_letter(&queue_name, msg),
        }

        self.dispatch(&queue_name);
        Ok(())
    }

    fn dead_letter(&mut self, queue_name: &str, mut msg: StoredMessage) {
        let Some(queue) = self.queues.get(queue_name) else {
            return;
        };

        let args = queue.def.arguments();
        let Some(AMQPValue::LongString(dlx)) =
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE))
        else {
            debug!("message rejected from queue: {} and dropped", queue_name);
            return;
        };

        let routing_key = match args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)) {
            Some(AMQPValue::LongString(key)) => long_string(key),
            _ => msg.routing_key.clone(),
        };
        let dlx = long_string(dlx);

        msg.headers
            .entry(ShortString::from(AMQP_HEADERS_FIRST_DEATH_REASON))
            .or_insert_with(|| AMQPValue::LongString(LongString::from("rejected")));
        msg.headers
            .entry(ShortString::from(AMQP_HEADERS_FIRST_DEATH_QUEUE))
            .or_insert_with(|| AMQPValue::LongString(LongString::from(queue_name)));
        msg.exchange = dlx.clone();
        msg.routing_key = routing_key.clone();
        msg.redelivered = false;

        if self.route(&dlx, &routing_key, msg).is_err() {
            warn!(
                "dead-letter exchange: {} does not exist, message from queue: {} dropped",
                dlx, queue_name
            );
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };

        let mut touched: Vec<String> = vec![];

        // oldest first at the head of the queue
        for (_, (queue_name, mut msg)) in channel.unacked.into_iter().rev() {
            msg.redelivered = true;
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.ready.push_front(msg);
            }
            if !touched.contains(&queue_name) {
                touched.push(queue_name);
            }
        }

        for consumer in &channel.consumers {
            if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                queue
                    .consumers
                    .retain(|(id, tag)| !(*id == channel_id && *tag == consumer.tag));
                queue.next_consumer = 0;

                if queue.def.is_auto_delete() && queue.consumers.is_empty() {
                    debug!("auto-deleting queue: {}", consumer.queue);
                    self.queues.remove(&consumer.queue);
                    continue;
                }
            }
            if !touched.contains(&consumer.queue) {
                touched.push(consumer.queue.clone());
            }
        }

        for name in touched {
            self.dispatch(&name);
        }
    }

    fn close_connection(&mut self, connection: u64) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == connection)
            .map(|(id, _)| *id)
            .collect();

        for id in channels {
            self.close_channel(id);
        }

        self.queues
            .retain(|_, queue| queue.owner != Some(connection));
        self.connections.remove(&connection);
    }

    fn snapshot(&self, name: &str) -> Option<QueueSnapshot> {
        let queue = self.queues.get(name)?;
        let unacked = self
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|(queue_name, _)| queue_name == name)
            .count();

        Some(QueueSnapshot {
            name: name.to_owned(),
            durable: queue.def.is_durable(),
            exclusive: queue.def.is_exclusive(),
            auto_delete: queue.def.is_auto_delete(),
            arguments: queue.def.arguments(),
            bindings: queue.bindings.clone(),
            ready: queue.ready.iter().map(|msg| msg.body.clone()).collect(),
            unacked,
            consumers: queue.consumers.len(),
        })
    }
}

fn long_string(value: &LongString) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

fn handle_of(queue: &QueueEntry) -> QueueHandle {
    QueueHandle {
        name: queue.def.name().to_owned(),
        message_count: queue.ready.len() as u32,
        consumer_count: queue.consumers.len() as u32,
    }
}

/// Matches a routing key against a binding key for the given exchange type.
///
/// Topic patterns are dot-separated words where `*` matches exactly one word
/// and `#` matches zero or more.
pub fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..])),
        Some((&head, rest)) => match words.split_first() {
            Some((&word, remaining)) if head == "*" || head == word => topic_matches(rest, remaining),
            _ => false,
        },
    }
}

/// In-process broker. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates an empty broker with no exchanges, queues or connections.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new client connection.
    pub fn connect(&self) -> Arc<InMemoryConnection> {
        let id = {
            let mut state = self.lock();
            let id = state.next_id();
            state.connections.insert(id);
            id
        };

        Arc::new(InMemoryConnection {
            broker: self.clone(),
            id,
        })
    }

    /// Returns a snapshot of `name`, or `None` when the queue does not exist.
    pub fn queue(&self, name: &str) -> Option<QueueSnapshot> {
        self.lock().snapshot(name)
    }

    /// Returns true if an exchange named `name` has been declared.
    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Publishes as an external producer, outside any client connection.
    pub fn inject(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<Vec<String>, AmqpError> {
        self.lock().route(
            exchange,
            routing_key,
            StoredMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                content_type: None,
                headers: Headers::new(),
                body: body.to_vec(),
                redelivered: false,
            },
        )
    }
}

/// Client connection to an `InMemoryBroker`.
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

impl InMemoryConnection {
    /// Closes every channel of this connection and deletes its exclusive queues.
    pub fn close(&self) {
        self.broker.lock().close_connection(self.id);
    }

    /// Returns true until `close` is called or the connection is dropped.
    pub fn is_open(&self) -> bool {
        self.broker.lock().connections.contains(&self.id)
    }

    /// Opens a channel on this connection.
    ///
    /// # Returns
    /// The new channel, or `ChannelError` once the connection is closed
    pub fn create_channel(&self) -> Result<Arc<InMemoryChannel>, AmqpError> {
        let mut state = self.broker.lock();
        if !state.connections.contains(&self.id) {
            return Err(AmqpError::ChannelError);
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                consumers: vec![],
            },
        );

        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
            id,
        }))
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel: Arc<dyn BrokerChannel> = self.create_channel()?;
        Ok(channel)
    }
}

/// Channel on an `InMemoryConnection`.
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    connection: u64,
    id: u64,
}

impl InMemoryChannel {
    /// Returns true until the channel or its connection is closed.
    pub fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.id)
    }

    fn ensure_open(&self, state: &mut BrokerState) -> Result<(), AmqpError> {
        state.channel(self.id).map(|_| ())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        self.ensure_open(&mut state)?;
        state.declare_exchange(def)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        let mut state = self.broker.lock();
        self.ensure_open(&mut state)?;
        state.declare_queue(self.connection, def)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        self.ensure_open(&mut state)?;
        state.bind_queue(self.connection, binding)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state
            .channel(self.id)
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))?
            .prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let receiver = self.broker.lock().consume(self.id, queue, consumer_tag)?;

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.broker.lock().settle(self.id, delivery_tag, None)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.broker.lock().settle(self.id, delivery_tag, Some(requeue))
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        self.ensure_open(&mut state)?;

        let mut headers = msg.headers.clone();
        headers.insert(
            ShortString::from("message-id"),
            AMQPValue::LongString(LongString::from(msg.message_id.clone())),
        );

        state
            .route(
                &msg.exchange,
                &msg.routing_key,
                StoredMessage {
                    exchange: msg.exchange.clone(),
                    routing_key: msg.routing_key.clone(),
                    content_type: Some(msg.content_type.clone()),
                    headers,
                    body: msg.payload.clone(),
                    redelivered: false,
                },
            )
            .map(|_| ())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        self.ensure_open(&mut state)?;
        state.close_channel(self.id);
        Ok(())
    }
}
