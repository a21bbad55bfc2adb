//! Reference Registry
//!
//! The registry guarantees that every call site asking for the same
//! persistence identity gets the same reference cell, not a private copy.
//!
//! # How It Works
//!
//! 1. `acquire` looks the identity up. A hit bumps the refcount and returns the
//!    existing cell.
//!
//! 2. A miss releases the registry lock, builds the cell (which may load from
//!    disk), then re-locks to insert it. If another thread inserted the same
//!    identity in the meantime, its cell wins and ours is discarded. The
//!    registry lock and a cell lock are never held at the same time.
//!
//! 3. Every successful acquisition hands back a [`Lease`]. Dropping the lease
//!    releases the acquisition; the last release removes the entry and cancels
//!    the cell's external subscription.
//!
//! # Lookup
//!
//! Handles find the registry through [`PersistentReferences::current`]: the
//! innermost registry installed with [`PersistentReferences::scoped`] on this
//! thread, or the process-wide live registry. Tests install an isolated
//! registry per test so entries never leak between them.

use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::reference::{Value, ValueReference};
use crate::config::SharedConfig;
use crate::persistence::PersistenceId;

/// The registry's view of a cell: enough to tear it down and to recover its
/// concrete type.
pub(crate) trait ErasedReference: Send + Sync {
    fn evict(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<V: Value> ErasedReference for ValueReference<V> {
    fn evict(&self) {
        ValueReference::evict(self);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Recover the concrete cell type.
///
/// # Panics
///
/// Panics if `id` was first registered with a different value type.
fn downcast<V: Value>(id: &PersistenceId, reference: &Arc<dyn ErasedReference>) -> Arc<ValueReference<V>> {
    match Arc::clone(reference).into_any().downcast::<ValueReference<V>>() {
        Ok(reference) => reference,
        Err(_) => panic!(
            "{id} is already shared with a value type other than {}",
            type_name::<V>()
        ),
    }
}

struct Entry {
    count: usize,
    reference: Arc<dyn ErasedReference>,
}

struct RegistryInner {
    entries: Mutex<HashMap<PersistenceId, Entry>>,
    config: SharedConfig,
}

static LIVE: OnceLock<PersistentReferences> = OnceLock::new();

thread_local! {
    static SCOPED: RefCell<Vec<PersistentReferences>> = const { RefCell::new(Vec::new()) };
}

/// Table of persisted references, keyed by persistence identity.
///
/// Cloning shares the table.
#[derive(Clone)]
pub struct PersistentReferences {
    inner: Arc<RegistryInner>,
}

impl PersistentReferences {
    /// Create an empty registry with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SharedConfig::default())
    }

    /// Create an empty registry whose cells use `config`.
    pub fn with_config(config: SharedConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// The process-wide registry.
    pub fn live() -> Self {
        LIVE.get_or_init(Self::new).clone()
    }

    /// The registry in effect on this thread.
    pub fn current() -> Self {
        SCOPED
            .with(|scoped| scoped.borrow().last().cloned())
            .unwrap_or_else(Self::live)
    }

    /// Run `f` with this registry as [`current`](Self::current) on this
    /// thread.
    pub fn scoped<R>(&self, f: impl FnOnce() -> R) -> R {
        struct PopOnDrop;

        impl Drop for PopOnDrop {
            fn drop(&mut self) {
                SCOPED.with(|scoped| {
                    scoped.borrow_mut().pop();
                });
            }
        }

        SCOPED.with(|scoped| scoped.borrow_mut().push(self.clone()));
        let _pop = PopOnDrop;
        f()
    }

    /// The configuration applied to new cells.
    pub fn config(&self) -> &SharedConfig {
        &self.inner.config
    }

    /// Number of live leases on `id`; zero if it is not registered.
    pub fn ref_count(&self, id: &PersistenceId) -> usize {
        self.inner
            .entries
            .lock()
            .get(id)
            .map_or(0, |entry| entry.count)
    }

    /// Whether `id` currently has a cell.
    pub fn contains(&self, id: &PersistenceId) -> bool {
        self.inner.entries.lock().contains_key(id)
    }

    /// Number of registered identities.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Whether two values are handles to the same table.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Get the cell for `id`, building it with `build` if there is none.
    pub(crate) fn acquire<V, F>(&self, id: PersistenceId, build: F) -> (Arc<ValueReference<V>>, Lease)
    where
        V: Value,
        F: FnOnce() -> Arc<ValueReference<V>>,
    {
        {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(&id) {
                let reference = downcast::<V>(&id, &entry.reference);
                entry.count += 1;
                tracing::debug!(%id, count = entry.count, "shared reference reused");
                return (reference, Lease::new(self.clone(), id));
            }
        }

        let built = build();

        let mut entries = self.inner.entries.lock();
        let winner = match entries.entry(id.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let reference = downcast::<V>(&id, &entry.reference);
                entry.count += 1;
                Some(reference)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    count: 1,
                    reference: built.clone(),
                });
                None
            }
        };
        drop(entries);

        let reference = match winner {
            Some(reference) => {
                tracing::debug!(%id, "lost race to register shared reference");
                built.evict();
                reference
            }
            None => {
                tracing::debug!(%id, "shared reference registered");
                built
            }
        };

        (reference, Lease::new(self.clone(), id))
    }

    /// Drop one acquisition of `id`.
    pub(crate) fn release(&self, id: &PersistenceId) {
        let evicted = {
            let mut entries = self.inner.entries.lock();
            let remaining = entries.get_mut(id).map(|entry| {
                entry.count -= 1;
                entry.count
            });
            match remaining {
                Some(0) => entries.remove(id).map(|entry| entry.reference),
                Some(count) => {
                    tracing::debug!(%id, count, "shared reference released");
                    None
                }
                None => {
                    tracing::warn!(%id, "released a shared reference that was not registered");
                    None
                }
            }
        };

        // Registry lock released before touching the cell
        if let Some(reference) = evicted {
            reference.evict();
            tracing::debug!(%id, "shared reference evicted");
        }
    }
}

impl Default for PersistentReferences {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PersistentReferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentReferences")
            .field("entries", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// One registry acquisition. Releases it on drop.
///
/// Handles share their lease through an `Arc`, so the release happens exactly
/// once, when the last clone of the acquiring handle goes away.
pub(crate) struct Lease {
    registry: PersistentReferences,
    id: PersistenceId,
}

impl Lease {
    fn new(registry: PersistentReferences, id: PersistenceId) -> Self {
        Self { registry, id }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::Location;

    fn build(value: u32) -> impl FnOnce() -> Arc<ValueReference<u32>> {
        move || ValueReference::new(value, &SharedConfig::default(), Location::caller())
    }

    #[test]
    fn acquire_shares_and_counts() {
        let registry = PersistentReferences::new();
        let id = PersistenceId::new("memory", "count");

        let (first, first_lease) = registry.acquire(id.clone(), build(1));
        let (second, second_lease) = registry.acquire(id.clone(), build(2));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.ref_count(&id), 2);

        drop(first_lease);
        assert_eq!(registry.ref_count(&id), 1);
        assert!(registry.contains(&id));

        drop(second_lease);
        assert_eq!(registry.ref_count(&id), 0);
        assert!(registry.is_empty());
    }

    #[test]
    #[should_panic(expected = "already shared with a value type")]
    fn mismatched_value_type_panics() {
        let registry = PersistentReferences::new();
        let id = PersistenceId::new("memory", "count");

        let _held = registry.acquire(id.clone(), build(1));
        let _ = registry.acquire(id, || {
            ValueReference::new("text".to_owned(), &SharedConfig::default(), Location::caller())
        });
    }

    #[test]
    fn scoped_registry_is_current() {
        let isolated = PersistentReferences::new();
        assert!(!PersistentReferences::current().ptr_eq(&isolated));

        isolated.scoped(|| {
            assert!(PersistentReferences::current().ptr_eq(&isolated));

            let nested = PersistentReferences::new();
            nested.scoped(|| assert!(PersistentReferences::current().ptr_eq(&nested)));

            assert!(PersistentReferences::current().ptr_eq(&isolated));
        });

        assert!(PersistentReferences::current().ptr_eq(&PersistentReferences::live()));
    }

    #[test]
    fn release_of_unknown_id_is_ignored() {
        let registry = PersistentReferences::new();
        registry.release(&PersistenceId::new("memory", "ghost"));
        assert!(registry.is_empty());
    }
}
