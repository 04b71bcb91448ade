// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Processing of a single delivery: decode the body, hand the value to the
//! subscription's handler and translate the returned verdict into an ack or a
//! nack on the channel the delivery arrived on. Each delivery gets a consumer
//! span parented on the trace context found in its headers.

use crate::{broker::BrokerChannel, broker::Delivery, errors::AmqpError, otel};
use async_trait::async_trait;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    KeyValue,
};
use std::{borrow::Cow, future::Future};
use tracing::{debug, error, warn};

/// Disposition a handler assigns to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckVerdict {
    /// Processed; the broker removes the message.
    Ack,
    /// Not processed; the broker redelivers the message.
    NackRequeue,
    /// Rejected; the broker drops it or routes it to the dead-letter exchange.
    NackDiscard,
}

/// What the consumption loop does with a body its decoder rejects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeFailurePolicy {
    /// Nack the delivery without requeue and keep consuming.
    #[default]
    Discard,
    /// Nack the delivery with requeue and stop the subscription.
    Halt,
}

/// Application logic attached to a subscription.
///
/// A handler runs once per delivery and its verdict is the only way it
/// influences acknowledgment. A handler that publishes follow-up messages
/// should answer `NackRequeue` when that publish fails so the original
/// delivery is retried.
///
/// Any `Fn(T) -> impl Future<Output = AckVerdict>` closure is a handler.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, msg: T) -> AckVerdict;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckVerdict> + Send,
{
    async fn handle(&self, msg: T) -> AckVerdict {
        (self)(msg).await
    }
}

/// Decodes, dispatches and settles one delivery.
///
/// Returns the verdict that was applied. A decode failure under
/// `DecodeFailurePolicy::Halt` is returned as `Err(DecodeError)` after the
/// delivery has been requeued; the caller is expected to stop consuming.
pub(crate) async fn consume<T, D, H>(
    tracer: &BoxedTracer,
    channel: &dyn BrokerChannel,
    queue: &str,
    delivery: &Delivery,
    decode: &D,
    handler: &H,
    on_decode_failure: DecodeFailurePolicy,
) -> Result<AckVerdict, AmqpError>
where
    D: Fn(&[u8]) -> Result<T, AmqpError> + Send + Sync,
    H: MessageHandler<T>,
    T: Send + 'static,
{
    let mut span = otel::consumer_span(tracer, &delivery.headers, queue);
    span.set_attribute(KeyValue::new("messaging.destination", queue.to_owned()));
    span.set_attribute(KeyValue::new("messaging.rabbitmq.routing_key", delivery.routing_key.clone()));
    span.set_attribute(KeyValue::new("messaging.redelivered", delivery.redelivered));

    debug!(
        "received: {} bytes - queue: {} - routing key: {}",
        delivery.body.len(),
        queue,
        delivery.routing_key,
    );

    let value = match decode(&delivery.body) {
        Ok(value) => value,
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to decode delivery body"),
            });

            return match on_decode_failure {
                DecodeFailurePolicy::Discard => {
                    warn!(
                        error = err.to_string(),
                        queue = queue,
                        "removing message from queue - reason: undecodable body"
                    );
                    settle(channel, delivery.delivery_tag, AckVerdict::NackDiscard).await
                }
                DecodeFailurePolicy::Halt => {
                    error!(
                        error = err.to_string(),
                        queue = queue,
                        "could not decode delivery body, halting subscription"
                    );
                    if let Err(nack_err) =
                        settle(channel, delivery.delivery_tag, AckVerdict::NackRequeue).await
                    {
                        error!(error = nack_err.to_string(), "error whiling requeuing msg");
                    }
                    Err(err)
                }
            };
        }
    };

    let verdict = handler.handle(value).await;

    match settle(channel, delivery.delivery_tag, verdict).await {
        Ok(verdict) => {
            match verdict {
                AckVerdict::Ack => span.set_status(Status::Ok),
                AckVerdict::NackRequeue => span.set_status(Status::Error {
                    description: Cow::from("msg requeued"),
                }),
                AckVerdict::NackDiscard => span.set_status(Status::Error {
                    description: Cow::from("msg discarded"),
                }),
            }
            Ok(verdict)
        }
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
            Err(err)
        }
    }
}

/// Applies a verdict to a single delivery.
async fn settle(
    channel: &dyn BrokerChannel,
    delivery_tag: u64,
    verdict: AckVerdict,
) -> Result<AckVerdict, AmqpError> {
    match verdict {
        AckVerdict::Ack => {
            channel.ack(delivery_tag).await.map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })?;
            debug!("delivery acknowledged");
        }
        AckVerdict::NackRequeue => {
            channel.nack(delivery_tag, true).await.map_err(|err| {
                error!(error = err.to_string(), "error whiling requeuing msg");
                AmqpError::NackMessageError
            })?;
            warn!("delivery negatively acknowledged and requeued");
        }
        AckVerdict::NackDiscard => {
            channel.nack(delivery_tag, false).await.map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })?;
            warn!("delivery negatively acknowledged and discarded");
        }
    }

    Ok(verdict)
}
