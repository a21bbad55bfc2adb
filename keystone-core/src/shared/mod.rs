//! Shared State
//!
//! This module implements reference-counted, observable values that many
//! independent owners can read and write.
//!
//! # Concepts
//!
//! ## Reference cells
//!
//! A reference cell holds the current value behind a reentrant lock, writes
//! every change through to its persistence key, and publishes the new value
//! to change subscribers.
//!
//! ## Handles
//!
//! [`Shared`] and [`SharedReader`] are the front ends. Each pairs a cell with a
//! key-path, so a handle can expose the whole value or any part of it. Handles
//! derived from one another alias the same cell.
//!
//! ## Registry
//!
//! [`PersistentReferences`] makes every handle built from the same persistence
//! key share one cell, and tears the cell's external subscription down when the
//! last such handle is dropped.

mod handle;
mod key_path;
mod reader;
mod reference;
mod registry;

pub use handle::Shared;
pub use key_path::{KeyPath, WritableKeyPath};
pub use reader::SharedReader;
pub use reference::{Changes, ReferenceId, Value};
pub use registry::PersistentReferences;
