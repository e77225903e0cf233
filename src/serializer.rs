// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serialization
//!
//! Byte encoding of message bodies. Decode failures are turned into a
//! structural `Reject` by the typed handler, never retried.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

pub trait Serializer: Send + Sync {
    fn content_type(&self) -> &str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, AmqpError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, AmqpError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to encode payload");
            AmqpError::SerializationError(err.to_string())
        })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, AmqpError> {
        serde_json::from_slice(bytes).map_err(|err| AmqpError::SerializationError(err.to_string()))
    }
}
