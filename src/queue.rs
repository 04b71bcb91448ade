// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing queues and their bindings. `QueueKind` is the durability
//! class a subscription asks for; it maps deterministically onto the
//! durable / auto-delete / exclusive flags of a `QueueDefinition`.

use crate::topology::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY};
use lapin::types::{AMQPValue, LongString, ShortString};
use std::collections::BTreeMap;

/// Durability class of a subscription queue.
///
/// | kind      | durable | auto-delete | exclusive |
/// |-----------|---------|-------------|-----------|
/// | Durable   | yes     | no          | no        |
/// | Transient | no      | yes         | yes       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Survives broker restarts and may be shared by several consumers.
    Durable,
    /// Private to the declaring connection and removed when it goes away.
    Transient,
}

/// Definition of a queue with its declaration flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) dlx_name: Option<String>,
    pub(crate) dlx_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// The queue starts non-durable, non-exclusive and without auto-delete.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Creates a definition whose flags follow the given durability class.
    pub fn from_kind(name: &str, kind: QueueKind) -> QueueDefinition {
        let def = QueueDefinition::new(name);
        match kind {
            QueueKind::Durable => def.durable(),
            QueueKind::Transient => def.delete().exclusive(),
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Routes rejected messages to the given dead-letter exchange.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dlx_name = Some(exchange.to_owned());
        self
    }

    /// Overrides the routing key used when dead-lettering.
    ///
    /// Without it the broker keeps the message's original routing key.
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dlx_routing_key = Some(key.to_owned());
        self
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the queue survives broker restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Returns true if the queue is removed when its last consumer goes away.
    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    /// Returns true if the queue belongs to the declaring connection only.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Returns the dead-letter exchange, if one is set.
    pub fn dead_letter(&self) -> Option<&str> {
        self.dlx_name.as_deref()
    }

    /// Builds the `x-*` declaration arguments for this queue.
    pub fn arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = BTreeMap::new();

        if let Some(dlx) = &self.dlx_name {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dlx.clone())),
            );
        }

        if let Some(key) = &self.dlx_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// `exchange` and `routing_key`.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Returns the bound queue.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Returns the source exchange.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Returns the routing key or pattern of the binding.
    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// Result of a queue declaration as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}
