//! Keystone Core
//!
//! This crate provides the state layer for Keystone applications.
//! It implements:
//!
//! - Shared state: reference-counted, observable values with key-path
//!   projection
//! - Pluggable persistence keys (in-memory, key-value store, file)
//! - Observation hooks for re-render and recompute systems
//! - Reducer composition and effects
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `shared`: Reference cells, the registry, and the `Shared`/`SharedReader`
//!   handles
//! - `persistence`: Persistence key traits and the built-in backends
//! - `observe`: Will/did-change notifications and access tracking
//! - `reducer`: Reducer trait, combinators and effects
//!
//! # Example
//!
//! ```rust,ignore
//! use keystone_core::{key_path, Shared, InMemoryKey};
//!
//! // Two call sites asking for the same key share one value
//! let a = Shared::persisted(Settings::default(), InMemoryKey::new("settings"));
//! let b = Shared::persisted(Settings::default(), InMemoryKey::new("settings"));
//!
//! // Project a field and write through it
//! let volume = a.project(key_path!(Settings, volume));
//! volume.set(11);
//!
//! assert_eq!(b.get().volume, 11);
//! ```

pub mod config;
pub mod error;
pub mod observe;
pub mod persistence;
pub mod reducer;
pub mod shared;

pub use config::SharedConfig;
pub use error::{SharedError, StorageError};
pub use observe::{with_observation_tracking, ChangeEvent, Observation, Phase};
pub use persistence::{
    AppStorageKey, Codec, FileStorageKey, InMemoryKey, KeyValueStore, PersistenceId, PersistenceKey,
    PersistenceReaderKey, Subscription,
};
pub use reducer::{Effect, Reducer, ReducerExt};
pub use shared::{KeyPath, PersistentReferences, Shared, SharedReader, WritableKeyPath};
