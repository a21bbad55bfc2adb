//! Byte encodings used by storage backends.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;

/// How a backend turns values into bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    /// Human-readable JSON.
    #[default]
    Json,
    /// Compact MessagePack, with struct fields encoded by name.
    MessagePack,
}

impl Codec {
    /// Encode a value.
    pub fn encode<V: Serialize>(self, value: &V) -> Result<Vec<u8>, StorageError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec_pretty(value)?),
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    /// Decode a value.
    pub fn decode<V: DeserializeOwned>(self, bytes: &[u8]) -> Result<V, StorageError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}
