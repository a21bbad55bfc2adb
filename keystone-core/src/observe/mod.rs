//! Observation
//!
//! This module lets an external re-render or recompute system learn when
//! shared state changes, at key-path granularity.
//!
//! # Concepts
//!
//! ## Access tracking
//!
//! Reading a [`Shared`](crate::Shared) or [`SharedReader`](crate::SharedReader)
//! inside a [`TrackingScope`] records which reference and which key-path were
//! read. [`with_observation_tracking`] packages the common case: run a
//! closure, then get called back once when anything it read is about to
//! change.
//!
//! ## Will/did notifications
//!
//! Each reference owns an [`ObservationRegistrar`]. Every write is bracketed by
//! exactly one [`Phase::WillChange`] and one [`Phase::DidChange`] event carrying
//! the reference id and the key-path written through.
//!
//! # Implementation Notes
//!
//! Tracking uses a thread-local stack of scopes, so reads on one thread never
//! leak into a scope opened on another.

mod context;
mod observer;
mod registrar;

pub use context::{with_observation_tracking, Access, TrackingScope};
pub use observer::{paths_overlap, ChangeEvent, ObserverId, Phase};
pub use registrar::{Observation, ObservationRegistrar};
