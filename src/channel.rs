// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channels
//!
//! lapin-backed implementation of the broker contract. The process opens one
//! `AmqpConnection` at startup from its `Configs`, shares it between
//! subscriptions and closes it at shutdown; every subscription opens its own
//! `AmqpChannel` on it.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Delivery, DeliveryStream, OutboundMessage},
    configs::Configs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Reply code sent when closing channels and connections normally
const REPLY_SUCCESS: u16 = 200;

/// Shared connection to a RabbitMQ server.
pub struct AmqpConnection {
    conn: Connection,
}

impl AmqpConnection {
    /// Connects to the broker described by `cfg.rabbitmq`, naming the
    /// connection after `cfg.app.name`.
    pub async fn connect(cfg: &Configs) -> Result<Arc<AmqpConnection>, AmqpError> {
        debug!(
            host = %cfg.rabbitmq.host,
            port = cfg.rabbitmq.port,
            vhost = %cfg.rabbitmq.vhost,
            "creating amqp connection..."
        );
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app.name.clone()));

        let conn = match Connection::connect_uri(cfg.rabbitmq.amqp_uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(AmqpConnection { conn }))
    }

    /// Opens a lapin channel wrapped for the broker contract.
    pub async fn create_channel(&self) -> Result<Arc<AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Returns true while the underlying lapin connection is open.
    pub fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    /// Closes the connection; every channel opened on it ends with it.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError
            })
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel: Arc<dyn BrokerChannel> = self.create_channel().await?;
        Ok(channel)
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    /// Gives access to the wrapped lapin channel for operations outside the broker contract.
    pub fn inner(&self) -> &Channel {
        &self.channel
    }
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|c| c.to_string()),
        headers,
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: def.is_auto_delete(),
                    internal: def.is_internal(),
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name(), "error to declare the exchange");
                AmqpError::DeclareExchangeError(def.name().to_owned())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        match self
            .channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: def.is_exclusive(),
                    auto_delete: def.is_auto_delete(),
                    nowait: false,
                },
                FieldTable::from(def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
            Ok(queue) => Ok(QueueHandle {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                )
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(to_delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from(msg.content_type.clone()))
                    .with_message_id(ShortString::from(msg.message_id.clone()))
                    .with_headers(FieldTable::from(msg.headers.clone())),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "failure to close channel");
                AmqpError::ChannelError
            })
    }
}
