//! Reference Cells
//!
//! A [`ValueReference`] is the one place a shared value actually lives. Every
//! `Shared`/`SharedReader` handle, however deeply projected, reads and writes
//! through exactly one of these.
//!
//! # How Reference Cells Work
//!
//! 1. Reads take the cell lock and visit the current value in place.
//!
//! 2. Writes take the lock, apply the mutation to a copy, store it, write it
//!    through to the persistence key (if any) and publish it to change
//!    subscribers, all before the lock is released. The value is not borrowed
//!    while the key saves, so a backend that reports its own save back as an
//!    external change is applied in place.
//!
//! 3. Every change subscriber has its own unbounded queue. A slow subscriber
//!    only grows its queue; it never loses values or holds up a writer.
//!
//! 4. A cell created from a persistence key also listens for external
//!    changes. Those take the same lock, so a reader never sees a value that is
//!    half local and half external. Between a local write and an external one
//!    the last to take the lock wins.
//!
//! # Thread Safety
//!
//! The lock is a `parking_lot::ReentrantMutex`, so code running inside a write
//! (a mutation closure, a persistence backend) may read the same cell again on
//! the same thread. Observation callbacks run outside the lock.
//!
//! # Projections
//!
//! Handles hold an `Arc<dyn Reference<V>>`. For a handle over the whole cell
//! that is the cell itself; for derived handles it is a [`Projection`] that
//! pairs the parent reference with a key-path. Projections never copy state:
//! a write through one is a single mutation of the root value.

use std::any::{type_name, Any};
use std::cell::RefCell;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::mpsc;

use super::key_path::{join_names, KeyPath, WritableKeyPath};
use crate::config::SharedConfig;
use crate::observe::ObservationRegistrar;
use crate::persistence::{PersistenceId, PersistenceReaderKey, Subscription};

/// A stream of every value a reference takes after the stream was created.
///
/// The value current at subscription time is not replayed. The stream ends
/// when the reference is destroyed.
pub type Changes<V> = BoxStream<'static, V>;

/// Values that can live in a shared reference.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// Counter for generating unique reference IDs.
static REFERENCE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity of a reference cell.
///
/// Handles projected from the same cell report the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceId(u64);

impl ReferenceId {
    /// Generate a new unique reference ID.
    pub fn new() -> Self {
        Self(REFERENCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ReferenceId {
    fn default() -> Self {
        Self::new()
    }
}

/// Read access to a (possibly projected) reference.
pub(crate) trait ReadReference<V>: Send + Sync {
    fn id(&self) -> ReferenceId;

    /// Name of the key-path from the cell's root to this projection.
    fn path(&self) -> &Arc<str>;

    fn registrar(&self) -> &ObservationRegistrar;

    /// Visit the current value under the cell lock.
    fn with_value(&self, visit: &mut dyn FnMut(&V));

    fn changes(&self) -> Changes<V>;

    fn persistence_id(&self) -> Option<&PersistenceId>;

    /// The key the cell was created from.
    fn persistence_key(&self) -> Option<&ErasedKey>;

    fn location(&self) -> &'static Location<'static>;
}

/// Read-write access to a (possibly projected) reference.
pub(crate) trait Reference<V>: ReadReference<V> {
    /// Mutate the value as one atomic cell write.
    fn modify(&self, modify: &mut dyn FnMut(&mut V));
}

/// Run `read` against the current value of `reference`.
///
/// # Panics
///
/// Panics if the reference's key-path does not resolve against the cell's
/// value.
pub(crate) fn read_with<V, R, T>(reference: &T, read: impl FnOnce(&V) -> R) -> R
where
    T: ReadReference<V> + ?Sized,
{
    let mut read = Some(read);
    let mut out = None;
    reference.with_value(&mut |value: &V| {
        if let Some(read) = read.take() {
            out = Some(read(value));
        }
    });
    match out {
        Some(out) => out,
        None => panic!("shared value at `{}` did not resolve", reference.path()),
    }
}

pub(crate) type Saver<V> = Box<dyn Fn(&V) + Send + Sync>;

pub(crate) type ErasedKey = Arc<dyn Any + Send + Sync>;

struct Subscriber<V> {
    sender: mpsc::UnboundedSender<V>,
    backlog: Arc<AtomicUsize>,
}

/// Fan-out of new values to every live change stream.
struct Publisher<V> {
    subscribers: Mutex<Vec<Subscriber<V>>>,
    backlog_warning: Option<usize>,
}

impl<V: Value> Publisher<V> {
    fn new(config: &SharedConfig) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            backlog_warning: config.backlog_threshold(),
        }
    }

    fn subscribe(&self) -> Changes<V> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        self.subscribers.lock().push(Subscriber {
            sender,
            backlog: Arc::clone(&backlog),
        });

        stream::unfold((receiver, backlog), |(mut receiver, backlog)| async move {
            let Some(value) = receiver.recv().await else {
                return None;
            };
            backlog.fetch_sub(1, Ordering::Relaxed);
            Some((value, (receiver, backlog)))
        })
        .boxed()
    }

    /// Queue `value` for every subscriber, pruning streams that were dropped.
    fn publish(&self, reference: ReferenceId, value: &V) {
        self.subscribers.lock().retain(|subscriber| {
            let backlog = subscriber.backlog.fetch_add(1, Ordering::Relaxed) + 1;
            if subscriber.sender.send(value.clone()).is_err() {
                return false;
            }
            if Some(backlog) == self.backlog_warning {
                tracing::warn!(?reference, backlog, "change subscriber is falling behind");
            }
            true
        });
    }
}

/// The reference cell.
pub(crate) struct ValueReference<V> {
    id: ReferenceId,
    value: ReentrantMutex<RefCell<V>>,
    /// Write-through target. Installed at most once.
    saver: OnceLock<Saver<V>>,
    persistence_id: Option<PersistenceId>,
    persistence_key: Option<ErasedKey>,
    subscription: Mutex<Option<Subscription>>,
    changes: Publisher<V>,
    registrar: ObservationRegistrar,
    location: &'static Location<'static>,
    root_path: Arc<str>,
}

impl<V: Value> ValueReference<V> {
    /// A cell with no persistence.
    pub(crate) fn new(
        initial: V,
        config: &SharedConfig,
        location: &'static Location<'static>,
    ) -> Arc<Self> {
        Arc::new(Self::with_parts(initial, None, None, config, location))
    }

    /// A cell bound to a persistence key.
    ///
    /// The stored value wins over `initial` when the key can load one. An
    /// external-change subscription is installed immediately; a notification
    /// without a value resets the cell to `initial`.
    pub(crate) fn persisted<K>(
        initial: V,
        key: Arc<K>,
        config: &SharedConfig,
        location: &'static Location<'static>,
    ) -> Arc<Self>
    where
        K: PersistenceReaderKey<V>,
    {
        let loaded = key.load(Some(&initial));
        let value = loaded.unwrap_or_else(|| initial.clone());
        let erased: ErasedKey = key.clone();
        let reference = Arc::new(Self::with_parts(value, Some(key.id()), Some(erased), config, location));

        let weak = Arc::downgrade(&reference);
        let fallback = initial.clone();
        let subscription = key.subscribe(
            Some(&initial),
            Box::new(move |value: Option<V>| {
                if let Some(reference) = weak.upgrade() {
                    reference.replace_external(value.unwrap_or_else(|| fallback.clone()));
                }
            }),
        );
        *reference.subscription.lock() = Some(subscription);

        reference
    }

    fn with_parts(
        value: V,
        persistence_id: Option<PersistenceId>,
        persistence_key: Option<ErasedKey>,
        config: &SharedConfig,
        location: &'static Location<'static>,
    ) -> Self {
        Self {
            id: ReferenceId::new(),
            value: ReentrantMutex::new(RefCell::new(value)),
            saver: OnceLock::new(),
            persistence_id,
            persistence_key,
            subscription: Mutex::new(None),
            changes: Publisher::new(config),
            registrar: ObservationRegistrar::new(),
            location,
            root_path: Arc::from(""),
        }
    }

    /// Install the write-through target, unless one is already bound.
    pub(crate) fn bind_saver(&self, saver: Saver<V>) {
        if self.saver.set(saver).is_ok() {
            tracing::debug!(reference = ?self.id, "write-through bound");
        }
    }

    #[cfg(test)]
    pub(crate) fn writes_through(&self) -> bool {
        self.saver.get().is_some()
    }

    /// Whether an external-change subscription is still installed.
    #[cfg(test)]
    pub(crate) fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    /// Tear down the external-change subscription.
    pub(crate) fn evict(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.cancel();
            tracing::debug!(reference = ?self.id, "external subscription canceled");
        }
    }

    /// Apply a value delivered by the persistence backend.
    fn replace_external(&self, value: V) {
        self.registrar.will_set(self.id, &self.root_path);
        {
            let guard = self.value.lock();
            Self::store(&guard, value.clone());
            self.changes.publish(self.id, &value);
        }
        tracing::trace!(reference = ?self.id, "external value applied");
        self.registrar.did_set(self.id, &self.root_path);
    }

    fn store(slot: &RefCell<V>, value: V) {
        match slot.try_borrow_mut() {
            Ok(mut slot) => *slot = value,
            Err(_) => panic!(
                "shared value of type {} written while it is being read on the same thread",
                type_name::<V>()
            ),
        }
    }
}

impl<V: Value> ReadReference<V> for ValueReference<V> {
    fn id(&self) -> ReferenceId {
        self.id
    }

    fn path(&self) -> &Arc<str> {
        &self.root_path
    }

    fn registrar(&self) -> &ObservationRegistrar {
        &self.registrar
    }

    fn with_value(&self, visit: &mut dyn FnMut(&V)) {
        let guard = self.value.lock();
        let value = guard.borrow();
        visit(&value);
    }

    fn changes(&self) -> Changes<V> {
        self.changes.subscribe()
    }

    fn persistence_id(&self) -> Option<&PersistenceId> {
        self.persistence_id.as_ref()
    }

    fn persistence_key(&self) -> Option<&ErasedKey> {
        self.persistence_key.as_ref()
    }

    fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl<V: Value> Reference<V> for ValueReference<V> {
    fn modify(&self, modify: &mut dyn FnMut(&mut V)) {
        let guard = self.value.lock();
        // The closure runs on a copy so it may read this cell reentrantly.
        let mut next = guard.borrow().clone();
        modify(&mut next);
        Self::store(&guard, next.clone());

        // No borrow is held here: the save may feed an external change back.
        if let Some(save) = self.saver.get() {
            save(&next);
        }
        let current = guard.borrow().clone();
        self.changes.publish(self.id, &current);
        tracing::trace!(reference = ?self.id, "value written");
    }
}

impl<V> Drop for ValueReference<V> {
    fn drop(&mut self) {
        tracing::trace!(reference = ?self.id, "reference destroyed");
    }
}

impl<V> fmt::Debug for ValueReference<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Shared<{}>@{}:{}",
            type_name::<V>(),
            self.location.file(),
            self.location.line()
        )
    }
}

/// A writable projection of a parent reference through a key-path.
pub(crate) struct Projection<Root, V> {
    base: Arc<dyn Reference<Root>>,
    path: WritableKeyPath<Root, V>,
    name: Arc<str>,
}

impl<Root: Value, V: Value> Projection<Root, V> {
    pub(crate) fn new(base: Arc<dyn Reference<Root>>, path: WritableKeyPath<Root, V>) -> Self {
        let name = join_names(base.path(), path.name_arc());
        Self { base, path, name }
    }
}

impl<Root: Value, V: Value> ReadReference<V> for Projection<Root, V> {
    fn id(&self) -> ReferenceId {
        self.base.id()
    }

    fn path(&self) -> &Arc<str> {
        &self.name
    }

    fn registrar(&self) -> &ObservationRegistrar {
        self.base.registrar()
    }

    fn with_value(&self, visit: &mut dyn FnMut(&V)) {
        self.base
            .with_value(&mut |root: &Root| self.path.visit(root, &mut *visit));
    }

    fn changes(&self) -> Changes<V> {
        let path = self.path.clone();
        self.base.changes().map(move |root| path.get(&root)).boxed()
    }

    fn persistence_id(&self) -> Option<&PersistenceId> {
        self.base.persistence_id()
    }

    fn persistence_key(&self) -> Option<&ErasedKey> {
        self.base.persistence_key()
    }

    fn location(&self) -> &'static Location<'static> {
        self.base.location()
    }
}

impl<Root: Value, V: Value> Reference<V> for Projection<Root, V> {
    fn modify(&self, modify: &mut dyn FnMut(&mut V)) {
        self.base
            .modify(&mut |root: &mut Root| self.path.modify(root, &mut *modify));
    }
}

/// A read-only projection of a parent reference.
pub(crate) struct ReadProjection<Root, V> {
    base: Arc<dyn ReadReference<Root>>,
    path: KeyPath<Root, V>,
    name: Arc<str>,
}

impl<Root: Value, V: Value> ReadProjection<Root, V> {
    pub(crate) fn new(base: Arc<dyn ReadReference<Root>>, path: KeyPath<Root, V>) -> Self {
        // Computed views are observed through the path they are computed from.
        let name = if path.is_computed() {
            Arc::clone(base.path())
        } else {
            join_names(base.path(), path.name_arc())
        };
        Self { base, path, name }
    }
}

impl<Root: Value, V: Value> ReadReference<V> for ReadProjection<Root, V> {
    fn id(&self) -> ReferenceId {
        self.base.id()
    }

    fn path(&self) -> &Arc<str> {
        &self.name
    }

    fn registrar(&self) -> &ObservationRegistrar {
        self.base.registrar()
    }

    fn with_value(&self, visit: &mut dyn FnMut(&V)) {
        self.base
            .with_value(&mut |root: &Root| self.path.visit(root, &mut *visit));
    }

    fn changes(&self) -> Changes<V> {
        let path = self.path.clone();
        self.base.changes().map(move |root| path.get(&root)).boxed()
    }

    fn persistence_id(&self) -> Option<&PersistenceId> {
        self.base.persistence_id()
    }

    fn persistence_key(&self) -> Option<&ErasedKey> {
        self.base.persistence_key()
    }

    fn location(&self) -> &'static Location<'static> {
        self.base.location()
    }
}

/// Read-only view of a writable reference.
pub(crate) struct ReadOnly<V>(pub(crate) Arc<dyn Reference<V>>);

impl<V: Value> ReadReference<V> for ReadOnly<V> {
    fn id(&self) -> ReferenceId {
        self.0.id()
    }

    fn path(&self) -> &Arc<str> {
        self.0.path()
    }

    fn registrar(&self) -> &ObservationRegistrar {
        self.0.registrar()
    }

    fn with_value(&self, visit: &mut dyn FnMut(&V)) {
        self.0.with_value(visit);
    }

    fn changes(&self) -> Changes<V> {
        self.0.changes()
    }

    fn persistence_id(&self) -> Option<&PersistenceId> {
        self.0.persistence_id()
    }

    fn persistence_key(&self) -> Option<&ErasedKey> {
        self.0.persistence_key()
    }

    fn location(&self) -> &'static Location<'static> {
        self.0.location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{AppStorageKey, Codec, KeyValueStore, PersistenceKey};

    fn here() -> &'static Location<'static> {
        Location::caller()
    }

    fn read<V: Value>(reference: &dyn ReadReference<V>) -> V {
        read_with(reference, V::clone)
    }

    #[test]
    fn reference_get_and_modify() {
        let reference = ValueReference::new(0, &SharedConfig::default(), here());
        assert_eq!(read(&*reference), 0);

        reference.modify(&mut |value| *value = 42);
        assert_eq!(read(&*reference), 42);
    }

    #[test]
    fn reference_ids_are_unique() {
        let r1 = ValueReference::new(0, &SharedConfig::default(), here());
        let r2 = ValueReference::new(0, &SharedConfig::default(), here());
        assert_ne!(r1.id(), r2.id());
    }

    #[test]
    fn modify_may_read_reentrantly() {
        let reference = ValueReference::new(10, &SharedConfig::default(), here());
        let inner = Arc::clone(&reference);
        reference.modify(&mut |value| *value += read(&*inner));
        assert_eq!(read(&*reference), 20);
    }

    #[test]
    fn persisted_reference_prefers_stored_value() {
        let store = KeyValueStore::new();
        let key = AppStorageKey::<u32>::new(&store, "count");
        key.save(&9);

        let reference = ValueReference::persisted(1, Arc::new(key), &SharedConfig::default(), here());
        assert_eq!(read(&*reference), 9);
        assert!(reference.is_subscribed());
        assert!(!reference.writes_through());
    }

    #[test]
    fn external_changes_replace_value_and_fall_back_to_default() {
        let store = KeyValueStore::new();
        let key = AppStorageKey::<u32>::new(&store, "count");
        let reference = ValueReference::persisted(1, Arc::new(key), &SharedConfig::default(), here());

        store.set_value("count", &5u32, Codec::Json).unwrap();
        assert_eq!(read(&*reference), 5);

        store.remove("count");
        assert_eq!(read(&*reference), 1);
    }

    #[test]
    fn evict_cancels_external_subscription() {
        let store = KeyValueStore::new();
        let key = AppStorageKey::<u32>::new(&store, "count");
        let reference = ValueReference::persisted(1, Arc::new(key), &SharedConfig::default(), here());

        reference.evict();
        reference.evict();
        assert!(!reference.is_subscribed());

        store.set_value("count", &5u32, Codec::Json).unwrap();
        assert_eq!(read(&*reference), 1);
    }

    #[test]
    fn bound_saver_writes_through() {
        let store = KeyValueStore::new();
        let key = Arc::new(AppStorageKey::<u32>::new(&store, "count"));
        let reference = ValueReference::persisted(1, Arc::clone(&key), &SharedConfig::default(), here());

        let saver_key = Arc::clone(&key);
        reference.bind_saver(Box::new(move |value: &u32| saver_key.save(value)));
        reference.modify(&mut |value| *value = 3);

        assert_eq!(key.load(None), Some(3));
    }

    #[tokio::test]
    async fn slow_subscribers_lose_nothing() {
        let config = SharedConfig { backlog_warning: 4 };
        let reference = ValueReference::new(0u32, &config, here());
        let mut slow = reference.changes();
        let dropped = reference.changes();
        drop(dropped);

        for value in 1..=200 {
            reference.modify(&mut |slot| *slot = value);
        }
        assert_eq!(reference.changes.subscribers.lock().len(), 1);
        drop(reference);

        let mut seen = Vec::new();
        while let Some(value) = slow.next().await {
            seen.push(value);
        }
        assert_eq!(seen, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn persisted_reference_keeps_its_key() {
        let store = KeyValueStore::new();
        let reference = ValueReference::persisted(
            1u32,
            Arc::new(AppStorageKey::<u32>::new(&store, "count")),
            &SharedConfig::default(),
            here(),
        );

        let key = Arc::clone(reference.persistence_key().unwrap())
            .downcast::<AppStorageKey<u32>>()
            .unwrap();
        assert_eq!(key.key(), "count");
        assert!(ValueReference::new(0u32, &SharedConfig::default(), here())
            .persistence_key()
            .is_none());
    }

    #[test]
    fn projections_share_one_cell() {
        let root = ValueReference::new((1, 2), &SharedConfig::default(), here());
        let first: Arc<dyn Reference<(i32, i32)>> = root.clone();
        let path = WritableKeyPath::new("0", |pair: &(i32, i32)| &pair.0, |pair: &mut (i32, i32)| &mut pair.0);
        let projection = Projection::new(first, path);

        projection.modify(&mut |value| *value = 10);
        assert_eq!(read(&*root), (10, 2));
        assert_eq!(projection.id(), root.id());
        assert_eq!(projection.path().as_ref(), "0");
    }

    #[test]
    fn debug_names_type_and_location() {
        let reference = ValueReference::new(0u8, &SharedConfig::default(), here());
        let description = format!("{reference:?}");
        assert!(description.starts_with("Shared<u8>@"));
        assert!(description.contains("reference.rs"));
    }
}
