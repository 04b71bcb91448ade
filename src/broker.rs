// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Contract
//!
//! The primitives the consumption layer needs from a message broker client.
//! `channel` implements them on top of lapin; `memory` implements them with an
//! in-process broker. Everything above this module (topology, subscriptions,
//! publishing) only talks to these traits.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::types::{AMQPValue, ShortString};
use std::{collections::BTreeMap, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Headers attached to a message, in AMQP field-table form.
pub type Headers = BTreeMap<ShortString, AMQPValue>;

/// Feed of deliveries produced by `BrokerChannel::consume`.
///
/// The stream ends when the channel or its connection closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// One instance of a message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Handle used to ack or nack this delivery on the channel it arrived on.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub content_type: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub message_id: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

/// A live connection able to multiplex channels.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a fresh channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// A broker channel.
///
/// Acknowledgments are always for a single delivery (`multiple = false`) and
/// prefetch is always per consumer with no byte limit.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Caps the number of unacknowledged deliveries pushed to this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Opens a manually acknowledged delivery feed on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
