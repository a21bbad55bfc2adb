//! Shared Handle
//!
//! [`Shared`] is the read-write front end of a reference cell. It is cheap to
//! clone: clones point at the same cell and the same projection.
//!
//! # Ownership
//!
//! A handle built from a persistence key holds a lease on the registry entry
//! for that key. Clones share the lease, so the entry is released when the
//! last clone goes away. Handles built from a bare value, and handles
//! projected from another handle, hold no lease and never touch the registry.
//!
//! # Writes
//!
//! However deep the projection, a write is a single mutation of the cell's
//! root value, bracketed by one will-change and one did-change notification on
//! the handle's key-path.
//!
//! # Equality
//!
//! Handles compare, hash and serialize by their projected value. Two handles
//! over different cells holding equal values are equal; two handles over the
//! same cell projecting to different values are not.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

use serde::{Serialize, Serializer};

use super::key_path::WritableKeyPath;
use super::reader::SharedReader;
use super::reference::{read_with, Changes, Projection, ReadOnly, Reference, ReferenceId, Value, ValueReference};
use super::registry::{Lease, PersistentReferences};
use crate::config::SharedConfig;
use crate::error::{Result, SharedError};
use crate::observe::{ChangeEvent, Observation};
use crate::persistence::{PersistenceId, PersistenceKey};

/// A read-write handle to shared state.
///
/// # Example
///
/// ```rust,ignore
/// let settings = Shared::persisted(Settings::default(), FileStorageKey::new("settings.json"));
///
/// let theme = settings.project(key_path!(Settings, theme));
/// theme.set(Theme::Dark);
///
/// assert_eq!(settings.get().theme, Theme::Dark);
/// ```
pub struct Shared<V> {
    reference: Arc<dyn Reference<V>>,
    lease: Option<Arc<Lease>>,
}

impl<V> Clone for Shared<V> {
    fn clone(&self) -> Self {
        Self {
            reference: Arc::clone(&self.reference),
            lease: self.lease.clone(),
        }
    }
}

impl<V: Value> Shared<V> {
    /// Create a handle to a fresh, unshared cell.
    #[track_caller]
    pub fn new(value: V) -> Self {
        let reference = ValueReference::new(value, &SharedConfig::default(), Location::caller());
        Self {
            reference,
            lease: None,
        }
    }

    /// Create a handle to the cell for `key` in the current registry.
    ///
    /// The first handle for a key loads its value from the key, falling back to
    /// `default`. Later handles share the existing cell and ignore `default`.
    /// Every write through any of them is saved to `key`.
    #[track_caller]
    pub fn persisted<K>(default: V, key: K) -> Self
    where
        K: PersistenceKey<V>,
    {
        Self::persisted_in(&PersistentReferences::current(), default, key)
    }

    /// Like [`persisted`](Self::persisted), against an explicit registry.
    #[track_caller]
    pub fn persisted_in<K>(registry: &PersistentReferences, default: V, key: K) -> Self
    where
        K: PersistenceKey<V>,
    {
        let location = Location::caller();
        let key = Arc::new(key);
        let (reference, lease) = registry.acquire(key.id(), || {
            ValueReference::persisted(default, Arc::clone(&key), registry.config(), location)
        });
        reference.bind_saver(Box::new(move |value: &V| key.save(value)));

        Self {
            reference,
            lease: Some(Arc::new(lease)),
        }
    }

    /// Create a handle whose initial value must come from `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SharedError::Load`] if the key has nothing to load.
    #[track_caller]
    pub fn load<K>(key: K) -> Result<Self>
    where
        K: PersistenceKey<V>,
    {
        Self::load_in(&PersistentReferences::current(), key)
    }

    /// Like [`load`](Self::load), against an explicit registry.
    #[track_caller]
    pub fn load_in<K>(registry: &PersistentReferences, key: K) -> Result<Self>
    where
        K: PersistenceKey<V>,
    {
        match key.load(None) {
            Some(initial) => Ok(Self::persisted_in(registry, initial, key)),
            None => Err(SharedError::Load(key.id())),
        }
    }

    /// Get the current value.
    ///
    /// Inside a tracking scope this also records the read.
    pub fn get(&self) -> V {
        self.track();
        self.get_untracked()
    }

    /// Get the current value without recording the read.
    pub fn get_untracked(&self) -> V {
        read_with(&*self.reference, V::clone)
    }

    /// Run `f` against the current value without cloning it.
    ///
    /// The cell stays locked while `f` runs; writing to the same cell from
    /// inside `f` panics.
    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        self.track();
        read_with(&*self.reference, f)
    }

    /// Replace the value.
    pub fn set(&self, value: V) {
        let mut value = Some(value);
        self.write(&mut |slot: &mut V| {
            if let Some(value) = value.take() {
                *slot = value;
            }
        });
    }

    /// Mutate the value in place.
    ///
    /// `f` runs on a copy of the current value, so it may read this handle.
    pub fn update(&self, f: impl FnOnce(&mut V)) {
        let mut f = Some(f);
        self.write(&mut |value: &mut V| {
            if let Some(f) = f.take() {
                f(value);
            }
        });
    }

    /// Derive a handle to a part of the value.
    ///
    /// The derived handle aliases this one: it reads and writes the same cell.
    /// It holds no lease, so this handle's lifetime still governs the registry
    /// entry.
    pub fn project<M: Value>(&self, path: WritableKeyPath<V, M>) -> Shared<M> {
        Shared {
            reference: Arc::new(Projection::new(Arc::clone(&self.reference), path)),
            lease: None,
        }
    }

    /// Derive a handle to an optional part of the value.
    ///
    /// Returns `None` while the part is absent. If it becomes absent later,
    /// the derived handle reads the value it had when it was created; writing
    /// through it then stores the new value as present.
    pub fn project_optional<M: Value>(&self, path: WritableKeyPath<V, Option<M>>) -> Option<Shared<M>> {
        let current = self.with(|value| path.get(value))?;
        Some(self.project(path.or_default(current)))
    }

    /// A read-only view of this handle. The view shares this handle's lease.
    pub fn reader(&self) -> SharedReader<V> {
        SharedReader::from_parts(Arc::new(ReadOnly(Arc::clone(&self.reference))), self.lease.clone())
    }

    /// Stream every value this handle takes from now on.
    pub fn publisher(&self) -> Changes<V> {
        self.reference.changes()
    }

    /// Call `callback` around every write that touches this handle's path.
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

    /// The key-path from the cell's root to this handle's value.
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

    fn write(&self, modify: &mut dyn FnMut(&mut V)) {
        let id = self.reference.id();
        let path = self.reference.path();
        let registrar = self.reference.registrar();

        registrar.will_set(id, path);
        self.reference.modify(modify);
        registrar.did_set(id, path);
    }
}

impl<W: Value> Shared<Option<W>> {
    /// [`persisted`](Shared::persisted) with `None` as the default.
    #[track_caller]
    pub fn persisted_optional<K>(key: K) -> Self
    where
        K: PersistenceKey<Option<W>>,
    {
        Self::persisted(None, key)
    }
}

impl<C: Value> Shared<C> {
    /// One derived handle per element, addressed by index.
    ///
    /// The sequence is lazy: each element is read when the iterator reaches
    /// it. If the collection shrinks afterwards, a handle whose index is gone
    /// reads the element it was created with and drops writes.
    pub fn elements<T>(&self) -> impl Iterator<Item = Shared<T>>
    where
        C: AsRef<[T]> + AsMut<[T]>,
        T: Value,
    {
        let collection = self.clone();
        let len = self.with(|elements| elements.as_ref().len());
        (0..len).map_while(move |index| {
            let element = collection.with(|elements| elements.as_ref().get(index).cloned())?;
            Some(collection.project(WritableKeyPath::index(index, element)))
        })
    }
}

impl<V: Value + PartialEq> PartialEq for Shared<V> {
    fn eq(&self, other: &Self) -> bool {
        // One lock at a time
        let left = self.get();
        other.with(|right| left == *right)
    }
}

impl<V: Value + Eq> Eq for Shared<V> {}

impl<V: Value + Hash> Hash for Shared<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state));
    }
}

impl<V: Value + fmt::Debug> fmt::Debug for Shared<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = self.location();
        read_with(&*self.reference, |value| {
            f.debug_struct("Shared")
                .field("value", value)
                .field("path", &self.path())
                .field("location", &format_args!("{}:{}", location.file(), location.line()))
                .finish()
        })
    }
}

impl<V: Value + Serialize> Serialize for Shared<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        read_with(&*self.reference, |value| value.serialize(serializer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_path;
    use crate::observe::Phase;
    use crate::persistence::{AppStorageKey, Codec, InMemoryKey, KeyValueStore};
    use parking_lot::Mutex;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    struct Form {
        title: String,
        note: Option<String>,
        scores: Vec<u32>,
    }

    fn form() -> Form {
        Form {
            title: "draft".into(),
            note: None,
            scores: vec![1, 2, 3],
        }
    }

    #[test]
    fn new_handles_are_unshared() {
        let a = Shared::new(1);
        let b = Shared::new(1);
        assert_ne!(a.reference_id(), b.reference_id());
        assert!(a.persistence_id().is_none());

        a.set(2);
        assert_eq!(b.get(), 1);
    }

    #[test]
    fn clones_alias_the_same_cell() {
        let a = Shared::new(1);
        let b = a.clone();
        b.update(|value| *value += 10);
        assert_eq!(a.get(), 11);
    }

    #[test]
    fn update_may_read_the_handle() {
        let counter = Shared::new(5);
        let inner = counter.clone();
        counter.update(|value| *value += inner.get());
        assert_eq!(counter.get(), 10);
    }

    #[test]
    fn persisted_handles_share_and_release() {
        let registry = PersistentReferences::new();
        let id = PersistenceId::new("memory", "count");

        let a = Shared::persisted_in(&registry, 0, InMemoryKey::new("count"));
        let b = Shared::persisted_in(&registry, 99, InMemoryKey::new("count"));
        assert_eq!(b.get(), 0);
        assert_eq!(registry.ref_count(&id), 2);

        let a_clone = a.clone();
        assert_eq!(registry.ref_count(&id), 2);

        drop(a);
        assert_eq!(registry.ref_count(&id), 2);
        drop(a_clone);
        assert_eq!(registry.ref_count(&id), 1);
        drop(b);
        assert!(!registry.contains(&id));
    }

    #[test]
    fn load_fails_without_stored_value() {
        let registry = PersistentReferences::new();
        let store = KeyValueStore::new();

        let missing = Shared::<u32>::load_in(&registry, AppStorageKey::new(&store, "count"));
        assert!(matches!(missing, Err(SharedError::Load(_))));
        assert!(registry.is_empty());

        store.set_value("count", &4u32, Codec::Json).unwrap();
        let loaded = Shared::<u32>::load_in(&registry, AppStorageKey::new(&store, "count")).unwrap();
        assert_eq!(loaded.get(), 4);
    }

    #[test]
    fn projections_alias_fields() {
        let form = Shared::new(form());
        let title = form.project(key_path!(Form, title));
        let scores = form.project(key_path!(Form, scores));

        title.set("final".into());
        assert_eq!(form.get().title, "final");
        assert_eq!(scores.get(), vec![1, 2, 3]);
        assert_eq!(title.path(), "title");
        assert_eq!(title.reference_id(), form.reference_id());
    }

    #[test]
    fn optional_projection_tracks_presence() {
        let form = Shared::new(form());
        assert!(form.project_optional(key_path!(Form, note)).is_none());

        form.update(|form| form.note = Some("hello".into()));
        let note = form.project_optional(key_path!(Form, note)).unwrap();
        assert_eq!(note.get(), "hello");

        form.update(|form| form.note = None);
        assert_eq!(note.get(), "hello");

        note.set("again".into());
        assert_eq!(form.get().note.as_deref(), Some("again"));
    }

    #[test]
    fn elements_are_indexed_projections() {
        let scores = Shared::new(form()).project(key_path!(Form, scores));
        let elements: Vec<_> = scores.elements().collect();
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[1].path(), "scores[1]");

        elements[1].set(20);
        assert_eq!(scores.get(), vec![1, 20, 3]);

        scores.set(vec![7]);
        assert_eq!(elements[2].get(), 3);
        elements[2].set(30);
        assert_eq!(scores.get(), vec![7]);
    }

    #[test]
    fn writes_are_bracketed_once() {
        let form = Shared::new(form());
        let title = form.project(key_path!(Form, title));
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let _observation = title.observe(move |event| {
            events_clone.lock().push((event.phase, event.path.to_string()));
        });

        title.set("x".into());
        form.project(key_path!(Form, scores)).set(vec![]);

        assert_eq!(
            *events.lock(),
            vec![
                (Phase::WillChange, "title".to_owned()),
                (Phase::DidChange, "title".to_owned()),
            ]
        );
    }

    #[test]
    fn equality_and_hash_follow_values() {
        use std::collections::HashSet;

        let a = Shared::new(form());
        let b = Shared::new(form());
        assert_eq!(a, b);

        let set: HashSet<_> = [a.clone(), b.clone()].into_iter().collect();
        assert_eq!(set.len(), 1);

        let scores = a.project(key_path!(Form, scores));
        let elements: Vec<_> = scores.elements().collect();
        assert_eq!(elements[0].reference_id(), elements[1].reference_id());
        assert_ne!(elements[0], elements[1]);

        elements[1].set(1);
        assert_eq!(elements[0], elements[1]);
    }

    #[test]
    fn persistence_key_is_recoverable_by_type() {
        let registry = PersistentReferences::new();
        let store = KeyValueStore::new();
        let form = Shared::persisted_in(&registry, form(), AppStorageKey::new(&store, "form"));
        let title = form.project(key_path!(Form, title));

        let key = title.persistence::<AppStorageKey<Form>>().unwrap();
        assert_eq!(key.key(), "form");
        assert!(form.persistence::<InMemoryKey<Form>>().is_none());
        assert!(Shared::new(1).persistence::<InMemoryKey<i32>>().is_none());
    }

    #[test]
    fn reader_shares_the_lease() {
        let registry = PersistentReferences::new();
        let id = PersistenceId::new("memory", "flag");

        let shared = Shared::persisted_in(&registry, false, InMemoryKey::new("flag"));
        let reader = shared.reader();
        drop(shared);
        assert_eq!(registry.ref_count(&id), 1);
        assert!(!reader.get());

        drop(reader);
        assert!(registry.is_empty());
    }

    #[test]
    fn debug_and_serialize_show_value() {
        let count = Shared::new(3u8);
        let description = format!("{count:?}");
        assert!(description.contains("value: 3"));
        assert!(description.contains("handle.rs"));

        assert_eq!(serde_json::to_string(&count).unwrap(), "3");
    }
}
