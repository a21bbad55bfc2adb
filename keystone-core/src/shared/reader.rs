//! Read-only Shared Handle
//!
//! [`SharedReader`] mirrors [`Shared`](super::Shared) without the write half.
//! Because it never writes back, its key-path may be any projection: a stored
//! field, an element, a default-substituted optional, or a computed view
//! ([`KeyPath::derived`]).
//!
//! A reader built from a persistence key acquires the registry entry like a
//! writable handle does, but never installs a write-through saver. If a
//! writable handle for the same key comes along later it binds one on the
//! shared cell.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

use serde::{Serialize, Serializer};

use super::handle::Shared;
use super::key_path::KeyPath;
use super::reference::{read_with, Changes, ReadProjection, ReadReference, ReferenceId, Value, ValueReference};
use super::registry::{Lease, PersistentReferences};
use crate::config::SharedConfig;
use crate::error::{Result, SharedError};
use crate::observe::{ChangeEvent, Observation};
use crate::persistence::{PersistenceId, PersistenceReaderKey};

/// A read-only handle to shared state.
pub struct SharedReader<V> {
    reference: Arc<dyn ReadReference<V>>,
    lease: Option<Arc<Lease>>,
}

impl<V> Clone for SharedReader<V> {
    fn clone(&self) -> Self {
        Self {
            reference: Arc::clone(&self.reference),
            lease: self.lease.clone(),
        }
    }
}

impl<V: Value> SharedReader<V> {
    /// A reader over a fresh, unshared cell. Nothing can change it.
    #[track_caller]
    pub fn new(value: V) -> Self {
        let reference = ValueReference::new(value, &SharedConfig::default(), Location::caller());
        Self::from_parts(reference, None)
    }

    pub(crate) fn from_parts(reference: Arc<dyn ReadReference<V>>, lease: Option<Arc<Lease>>) -> Self {
        Self { reference, lease }
    }

    /// A reader over the cell for `key` in the current registry.
    ///
    /// The cell still follows external changes reported by the key.
    #[track_caller]
    pub fn persisted<K>(default: V, key: K) -> Self
    where
        K: PersistenceReaderKey<V>,
    {
        Self::persisted_in(&PersistentReferences::current(), default, key)
    }

    /// Like [`persisted`](Self::persisted), against an explicit registry.
    #[track_caller]
    pub fn persisted_in<K>(registry: &PersistentReferences, default: V, key: K) -> Self
    where
        K: PersistenceReaderKey<V>,
    {
        let location = Location::caller();
        let key = Arc::new(key);
        let (reference, lease) = registry.acquire(key.id(), || {
            ValueReference::persisted(default, key, registry.config(), location)
        });
        Self::from_parts(reference, Some(Arc::new(lease)))
    }

    /// A reader whose initial value must come from `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SharedError::Load`] if the key has nothing to load.
    #[track_caller]
    pub fn load<K>(key: K) -> Result<Self>
    where
        K: PersistenceReaderKey<V>,
    {
        Self::load_in(&PersistentReferences::current(), key)
    }

    /// Like [`load`](Self::load), against an explicit registry.
    #[track_caller]
    pub fn load_in<K>(registry: &PersistentReferences, key: K) -> Result<Self>
    where
        K: PersistenceReaderKey<V>,
    {
        let Some(initial) = key.load(None) else {
            return Err(SharedError::Load(key.id()));
        };
        Ok(Self::persisted_in(registry, initial, key))
    }

    /// Get the current value, recording the read in any tracking scope.
    pub fn get(&self) -> V {
        self.track();
        self.get_untracked()
    }

    /// Get the current value without recording the read.
    pub fn get_untracked(&self) -> V {
        read_with(&*self.reference, V::clone)
    }

    /// Run `f` against the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        self.track();
        read_with(&*self.reference, f)
    }

    /// Derive a reader for a part of the value.
    pub fn project<M: Value>(&self, path: KeyPath<V, M>) -> SharedReader<M> {
        SharedReader {
            reference: Arc::new(ReadProjection::new(Arc::clone(&self.reference), path)),
            lease: None,
        }
    }

    /// Derive a reader for an optional part of the value. `None` while absent.
    pub fn project_optional<M: Value>(&self, path: KeyPath<V, Option<M>>) -> Option<SharedReader<M>> {
        let current = self.with(|value| path.get(value))?;
        Some(self.project(path.or_default(current)))
    }

    /// Stream every value this reader takes from now on.
    pub fn publisher(&self) -> Changes<V> {
        self.reference.changes()
    }

    /// Call `callback` around every write that touches this reader's path.
    pub fn observe<F>(&self, callback: F) -> Observation
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.reference
            .registrar()
            .observe(Some(Arc::clone(self.reference.path())), callback)
    }

    /// The persistence identity of the underlying cell, if it has one.
    pub fn persistence_id(&self) -> Option<&PersistenceId> {
        self.reference.persistence_id()
    }

    /// The persistence key the underlying cell was created from, if it is a
    /// `K`.
    pub fn persistence<K: Send + Sync + 'static>(&self) -> Option<Arc<K>> {
        Arc::clone(self.reference.persistence_key()?).downcast().ok()
    }

    /// The identity of the underlying cell.
    pub fn reference_id(&self) -> ReferenceId {
        self.reference.id()
    }

    /// The key-path from the cell's root to this reader's value.
    pub fn path(&self) -> &str {
        self.reference.path()
    }

    /// Where the underlying cell was created.
    pub fn location(&self) -> &'static Location<'static> {
        self.reference.location()
    }

    fn track(&self) {
        self.reference
            .registrar()
            .access(self.reference.id(), self.reference.path());
    }
}

impl<W: Value> SharedReader<Option<W>> {
    /// [`persisted`](SharedReader::persisted) with `None` as the default.
    #[track_caller]
    pub fn persisted_optional<K>(key: K) -> Self
    where
        K: PersistenceReaderKey<Option<W>>,
    {
        Self::persisted(None, key)
    }
}

impl<C: Value> SharedReader<C> {
    /// One derived reader per element, addressed by index.
    ///
    /// A reader whose index has gone stale keeps reading the element it was
    /// created with.
    pub fn elements<T>(&self) -> impl Iterator<Item = SharedReader<T>>
    where
        C: AsRef<[T]>,
        T: Value,
    {
        let collection = self.clone();
        let len = self.with(|elements| elements.as_ref().len());
        (0..len).map_while(move |index| {
            let element = collection.with(|elements| elements.as_ref().get(index).cloned())?;
            Some(collection.project(KeyPath::index(index, element)))
        })
    }
}

impl<V: Value> From<Shared<V>> for SharedReader<V> {
    fn from(shared: Shared<V>) -> Self {
        shared.reader()
    }
}

impl<V: Value + PartialEq> PartialEq for SharedReader<V> {
    fn eq(&self, other: &Self) -> bool {
        let left = self.get();
        other.with(|right| left == *right)
    }
}

impl<V: Value + Eq> Eq for SharedReader<V> {}

impl<V: Value + Hash> Hash for SharedReader<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state));
    }
}

impl<V: Value + fmt::Debug> fmt::Debug for SharedReader<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = self.location();
        read_with(&*self.reference, |value| {
            f.debug_struct("SharedReader")
                .field("value", value)
                .field("path", &self.path())
                .field("location", &format_args!("{}:{}", location.file(), location.line()))
                .finish()
        })
    }
}

impl<V: Value + Serialize> Serialize for SharedReader<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        read_with(&*self.reference, |value| value.serialize(serializer))
    }
}
