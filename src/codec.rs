// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Payload encoding. Message bodies are opaque to the topology layer; the codec
//! turns typed values into bytes and back.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encodes and decodes message bodies.
pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, AmqpError>;

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, AmqpError>;

    /// Value for the `content-type` property of published messages.
    fn content_type(&self) -> &'static str;
}

/// One JSON document per message.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, AmqpError> {
        serde_json::from_slice(payload).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }
}
