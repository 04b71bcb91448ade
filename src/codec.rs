// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! A codec is a pure `encode` / `decode` pair selected at the call site. The
//! broker never negotiates codecs, so a producer and the consumers of a queue
//! must agree on one out of band.
//!
//! - [`Json`]: UTF-8 JSON, self-describing and readable from any language
//! - [`Bincode`]: compact binary, only meaningful to Rust peers sharing the type

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};

/// Content type attached to JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type attached to bincode payloads
pub const BINCODE_CONTENT_TYPE: &str = "application/x-bincode";

/// Serialization strategy for message bodies.
pub trait Codec: Send + Sync + 'static {
    /// Value published in the message `content-type` property.
    const CONTENT_TYPE: &'static str;

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, AmqpError>;

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AmqpError>;
}

/// Structured-text codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Codec for Json {
    const CONTENT_TYPE: &'static str = JSON_CONTENT_TYPE;

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|err| AmqpError::EncodeError(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AmqpError> {
        serde_json::from_slice(bytes).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}

/// Compact binary codec backed by `bincode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bincode;

impl Codec for Bincode {
    const CONTENT_TYPE: &'static str = BINCODE_CONTENT_TYPE;

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, AmqpError> {
        bincode::serialize(value).map_err(|err| AmqpError::EncodeError(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AmqpError> {
        bincode::deserialize(bytes).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}
