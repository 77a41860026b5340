//! Message codecs
//!
//! A [`Codec`] converts between application messages and frame payloads. It
//! carries no per-connection state: one instance is shared read-only by every
//! session of a server.

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Codec error: {0}")]
    Other(String),
}

impl CodecError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Pluggable encode/decode strategy between payload bytes and messages
pub trait Codec: Send + Sync + 'static {
    /// Application message type produced by [`Codec::decode`]
    type Message: Send + 'static;

    fn encode(&self, message: &Self::Message) -> Result<Bytes, CodecError>;

    fn decode(&self, payload: &[u8]) -> Result<Self::Message, CodecError>;
}

/// JSON codec
///
/// Defaults to untyped [`serde_json::Value`] messages; any serde type works.
pub struct JsonCodec<T = serde_json::Value> {
    _message: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Message = T;

    fn encode(&self, message: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn decode(&self, payload: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Schema-driven binary codec backed by bincode
///
/// Both peers must agree on `T`; enum variant order is part of the wire
/// contract, so new variants go at the end.
pub struct BincodeCodec<T> {
    _message: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BincodeCodec")
    }
}

impl<T> Codec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Message = T;

    fn encode(&self, message: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(message)?))
    }

    fn decode(&self, payload: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(payload)?)
    }
}
