// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Typed Consumption Layer
//!
//! `AmqpError` covers every failure the layer can surface: subscription setup
//! (channel, declare, bind, QoS, consume), payload encoding and decoding, and
//! per-delivery acknowledgment. Setup variants are returned synchronously from
//! `subscribe*`; per-delivery variants are logged by the consumption loop and
//! confined to the delivery they belong to.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker or while
/// encoding and decoding message payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// A topology descriptor carried an empty or otherwise unusable field
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error opening a delivery feed on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error serializing a payload before publishing
    #[error("failure to encode payload: {0}")]
    EncodeError(String),

    /// Error deserializing a delivery body
    #[error("failure to decode payload: {0}")]
    DecodeError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error reading from a delivery feed
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Returns true for the errors that prevent a subscription from starting.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError
                | AmqpError::ChannelError
                | AmqpError::InvalidTopology(_)
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(..)
                | AmqpError::BindingConsumerError(_)
                | AmqpError::QoSDeclarationError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("peril_topic".into(), "army_moves".into());
        assert_eq!(
            err.to_string(),
            "failure to bind queue `army_moves` to exchange `peril_topic`"
        );
    }

    #[test]
    fn setup_errors_are_classified() {
        assert!(AmqpError::ChannelError.is_setup_error());
        assert!(AmqpError::QoSDeclarationError("x".into()).is_setup_error());
        assert!(!AmqpError::DecodeError("x".into()).is_setup_error());
        assert!(!AmqpError::AckMessageError.is_setup_error());
    }
}
