//! Observer identities and change events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::shared::ReferenceId;

/// Unique identifier for an observer registration.
///
/// Each registration on an [`ObservationRegistrar`](super::ObservationRegistrar)
/// gets its own id, even when one callback is registered on several
/// references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Generate a new unique observer ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

/// Which side of a mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WillChange,
    DidChange,
}

/// A notification that a reference is about to change, or just did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The reference being mutated.
    pub reference: ReferenceId,
    /// The key-path written through. Empty for whole-value writes.
    pub path: Arc<str>,
    pub phase: Phase,
}

/// Whether two key-path names can observe each other's writes.
///
/// The root path overlaps everything; otherwise one path must equal the other
/// or be a segment prefix of it (`a` overlaps `a.b` and `a[2]`, not `ab`).
pub fn paths_overlap(lhs: &str, rhs: &str) -> bool {
    fn is_prefix(prefix: &str, path: &str) -> bool {
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('.') || rest.starts_with('['),
            None => false,
        }
    }

    lhs.is_empty() || rhs.is_empty() || is_prefix(lhs, rhs) || is_prefix(rhs, lhs)
}
