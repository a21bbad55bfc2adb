//! Persistence Keys
//!
//! A persistence key is a capability object: it knows where a value lives and
//! how to load it, save it, and hear about changes made by someone else (another
//! process, another window, a settings pane writing to the same store).
//!
//! # Identity
//!
//! The registry shares one reference cell per [`PersistenceId`]. The id is
//! type-erased: two keys pointing at the same location are the same identity
//! whatever payload type they are declared with.
//!
//! # Backends
//!
//! - [`InMemoryKey`]: no storage at all. Values live only as long as some
//!   handle keeps them alive; sharing comes from the registry alone.
//! - [`AppStorageKey`]: entries in a [`KeyValueStore`], with change
//!   notifications when the store is written from outside.
//! - [`FileStorageKey`]: one file per key.

mod app_storage;
mod codec;
mod file;
mod memory;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

pub use app_storage::{AppStorageKey, KeyValueStore};
pub use codec::Codec;
pub use file::FileStorageKey;
pub use memory::InMemoryKey;

/// Callback a key invokes when its value changes externally.
///
/// `None` means the value was removed; the reference falls back to the default
/// it was created with.
pub type ChangeCallback<V> = Box<dyn Fn(Option<V>) + Send + Sync>;

/// Stable, hashable identity of a persisted location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistenceId {
    namespace: &'static str,
    location: Arc<str>,
}

impl PersistenceId {
    /// Create an identity from a backend namespace and a location within it.
    pub fn new(namespace: &'static str, location: impl Into<Arc<str>>) -> Self {
        Self {
            namespace,
            location: location.into(),
        }
    }

    /// The backend namespace, e.g. `"file"`.
    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// The location within the namespace.
    pub fn location(&self) -> &str {
        &self.location
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.location)
    }
}

/// A key that can load a value and report external changes to it.
pub trait PersistenceReaderKey<V>: Send + Sync + 'static {
    /// The identity used to share references between call sites.
    fn id(&self) -> PersistenceId;

    /// Load the stored value, if there is one.
    fn load(&self, initial: Option<&V>) -> Option<V>;

    /// Subscribe to changes made outside this process's handles.
    ///
    /// The default implementation never reports anything.
    fn subscribe(&self, initial: Option<&V>, on_change: ChangeCallback<V>) -> Subscription {
        let _ = (initial, on_change);
        Subscription::empty()
    }
}

/// A key that can also write values back.
pub trait PersistenceKey<V>: PersistenceReaderKey<V> {
    /// Persist a new value. Failures are the backend's to report.
    fn save(&self, value: &V);
}

/// A cancelable registration returned by [`PersistenceReaderKey::subscribe`].
///
/// The cancel action runs exactly once: on the first call to
/// [`Subscription::cancel`], or on drop.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Create a subscription that runs `cancel` when torn down.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn empty() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    /// Tear the subscription down. Later calls do nothing.
    pub fn cancel(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    /// Whether the subscription still has a pending cancel action.
    pub fn is_active(&self) -> bool {
        self.cancel.lock().is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ids_compare_by_namespace_and_location() {
        assert_eq!(PersistenceId::new("file", "a"), PersistenceId::new("file", "a"));
        assert_ne!(PersistenceId::new("file", "a"), PersistenceId::new("memory", "a"));
        assert_ne!(PersistenceId::new("file", "a"), PersistenceId::new("file", "b"));
        assert_eq!(PersistenceId::new("file", "a").to_string(), "file:a");
    }

    #[test]
    fn subscription_cancels_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let subscription = Subscription::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(subscription.is_active());

        subscription.cancel();
        subscription.cancel();
        drop(subscription);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_cancels_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        drop(Subscription::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
