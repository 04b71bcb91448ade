// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Typed Message Publisher
//!
//! Encodes a value with the codec chosen at the call site and publishes it to
//! an exchange under a routing key. Publishing is fire-and-forget: no publisher
//! confirms are tracked at this level.

use crate::{
    broker::{BrokerChannel, Headers, OutboundMessage},
    codec::{Bincode, Codec, Json},
    errors::AmqpError,
    otel,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Publisher bound to one broker channel.
///
/// Cloning is cheap; clones share the channel.
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
}

impl Publisher {
    /// Creates a new publisher on `channel`.
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Publisher {
        Publisher { channel }
    }

    /// Encodes `value` with `C` and publishes it to `exchange` under `routing_key`.
    ///
    /// Fails with `EncodeError` when the value cannot be serialized and with
    /// `PublishingError` when the broker refuses the message.
    pub async fn publish<C, T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), AmqpError>
    where
        C: Codec,
        T: Serialize + ?Sized,
    {
        let payload = C::encode(value)?;

        let mut headers = Headers::new();
        otel::inject_current(&mut headers);

        let msg = OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            content_type: C::CONTENT_TYPE.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            headers,
            payload,
        };

        match self.channel.publish(&msg).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = exchange,
                    routing_key = routing_key,
                    "error publishing message"
                );
                Err(AmqpError::PublishingError)
            }
            _ => {
                debug!(
                    "published {} bytes to exchange: {} with the key: {}",
                    msg.payload.len(),
                    exchange,
                    routing_key
                );
                Ok(())
            }
        }
    }

    /// Publishes `value` as JSON.
    pub async fn publish_json<T>(&self, exchange: &str, routing_key: &str, value: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish::<Json, T>(exchange, routing_key, value).await
    }

    /// Publishes `value` as bincode.
    pub async fn publish_bincode<T>(&self, exchange: &str, routing_key: &str, value: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish::<Bincode, T>(exchange, routing_key, value).await
    }
}
