//! Error types.
//!
//! Only two kinds of failure are recoverable in Keystone: a throwing
//! constructor that finds nothing to load, and a storage backend that fails to
//! read or write. Everything else (a key-path applied to the wrong root, two
//! value types registered under one persistence identity) is a programming
//! error and panics.

use thiserror::Error;

use crate::persistence::PersistenceId;

/// Errors surfaced by shared handle constructors.
#[derive(Debug, Error)]
pub enum SharedError {
    /// The persistence key had no value to load and no default was supplied.
    #[error("no initial value could be loaded for {0}")]
    Load(PersistenceId),
}

/// Errors raised inside storage backends.
///
/// These never cross the `PersistenceKey::save` boundary; backends log them
/// and keep the in-memory value authoritative.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON codec failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Result alias for shared handle constructors.
pub type Result<T, E = SharedError> = std::result::Result<T, E>;
