//! Key-value storage backend.
//!
//! [`KeyValueStore`] is a byte store shared by clones, playing the role of a
//! platform preferences database. [`AppStorageKey`] binds one entry of it to a
//! typed value.
//!
//! Writes made through a key are silent: the reference that saved the value
//! already holds it. Writes made directly on the store ([`KeyValueStore::set`],
//! [`KeyValueStore::remove`]) are treated as external and are delivered to every
//! key subscribed to that entry.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;

use super::{ChangeCallback, Codec, PersistenceId, PersistenceKey, PersistenceReaderKey, Subscription};
use crate::error::StorageError;

type Listener = Arc<dyn Fn(Option<&[u8]>) + Send + Sync>;

struct StoreInner {
    entries: DashMap<String, Vec<u8>>,
    listeners: DashMap<String, Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

/// A thread-safe byte store with change notification.
#[derive(Clone)]
pub struct KeyValueStore {
    inner: Arc<StoreInner>,
}

impl KeyValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                listeners: DashMap::new(),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// Read the raw bytes of an entry.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Whether an entry exists.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Write an entry and notify subscribers.
    pub fn set(&self, key: &str, bytes: Vec<u8>) {
        self.inner.entries.insert(key.to_owned(), bytes.clone());
        self.notify(key, Some(&bytes));
    }

    /// Encode and write a value, notifying subscribers.
    pub fn set_value<V: Serialize>(&self, key: &str, value: &V, codec: Codec) -> Result<(), StorageError> {
        let bytes = codec.encode(value)?;
        self.set(key, bytes);
        Ok(())
    }

    /// Remove an entry and notify subscribers with `None`.
    pub fn remove(&self, key: &str) {
        self.inner.entries.remove(key);
        self.notify(key, None);
    }

    fn write_silently(&self, key: &str, bytes: Vec<u8>) {
        self.inner.entries.insert(key.to_owned(), bytes);
    }

    fn listen(&self, key: &str, listener: Listener) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .entry(key.to_owned())
            .or_default()
            .push((id, listener));

        let inner = Arc::downgrade(&self.inner);
        let key = key.to_owned();
        Subscription::new(move || {
            let Some(inner) = inner.upgrade() else { return };
            let now_empty = match inner.listeners.get_mut(&key) {
                Some(mut listeners) => {
                    listeners.retain(|(listener_id, _)| *listener_id != id);
                    listeners.is_empty()
                }
                None => false,
            };
            if now_empty {
                inner.listeners.remove_if(&key, |_, listeners| listeners.is_empty());
            }
        })
    }

    fn notify(&self, key: &str, bytes: Option<&[u8]>) {
        // Listeners run outside the shard lock so they may touch the store.
        let listeners: SmallVec<[Listener; 4]> = match self.inner.listeners.get(key) {
            Some(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            listener(bytes);
        }
    }
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("entries", &self.inner.entries.len())
            .field("observed_keys", &self.inner.listeners.len())
            .finish()
    }
}

/// A typed entry in a [`KeyValueStore`].
pub struct AppStorageKey<V> {
    store: KeyValueStore,
    key: Arc<str>,
    codec: Codec,
    _value: PhantomData<fn() -> V>,
}

impl<V> AppStorageKey<V> {
    /// Bind `key` in `store`, encoded as JSON.
    pub fn new(store: &KeyValueStore, key: impl Into<Arc<str>>) -> Self {
        Self {
            store: store.clone(),
            key: key.into(),
            codec: Codec::default(),
            _value: PhantomData,
        }
    }

    /// Use a different codec.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// The entry name.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<V> Clone for AppStorageKey<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            key: Arc::clone(&self.key),
            codec: self.codec,
            _value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for AppStorageKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppStorageKey")
            .field("key", &self.key)
            .field("codec", &self.codec)
            .finish()
    }
}

fn decode_entry<V: DeserializeOwned>(codec: Codec, key: &str, bytes: &[u8]) -> Option<V> {
    match codec.decode(bytes) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(key, %error, "failed to decode app storage entry");
            None
        }
    }
}

impl<V> PersistenceReaderKey<V> for AppStorageKey<V>
where
    V: Serialize + DeserializeOwned + 'static,
{
    fn id(&self) -> PersistenceId {
        PersistenceId::new("app-storage", Arc::clone(&self.key))
    }

    fn load(&self, _initial: Option<&V>) -> Option<V> {
        let bytes = self.store.get(&self.key)?;
        decode_entry(self.codec, &self.key, &bytes)
    }

    fn subscribe(&self, _initial: Option<&V>, on_change: ChangeCallback<V>) -> Subscription {
        let codec = self.codec;
        let key = Arc::clone(&self.key);
        self.store.listen(
            &self.key,
            Arc::new(move |bytes: Option<&[u8]>| match bytes {
                Some(bytes) => {
                    // An undecodable write is ignored rather than resetting to the default.
                    if let Some(value) = decode_entry(codec, &key, bytes) {
                        on_change(Some(value));
                    }
                }
                None => on_change(None),
            }),
        )
    }
}

impl<V> PersistenceKey<V> for AppStorageKey<V>
where
    V: Serialize + DeserializeOwned + 'static,
{
    fn save(&self, value: &V) {
        match self.codec.encode(value) {
            Ok(bytes) => self.store.write_silently(&self.key, bytes),
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "failed to encode app storage entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn save_then_load() {
        let store = KeyValueStore::new();
        let key = AppStorageKey::<Vec<u32>>::new(&store, "ids");

        assert_eq!(key.load(None), None);
        key.save(&vec![1, 2, 3]);
        assert_eq!(key.load(None), Some(vec![1, 2, 3]));
        assert!(store.contains("ids"));
    }

    #[test]
    fn message_pack_entries_load_back() {
        let store = KeyValueStore::new();
        let key = AppStorageKey::<String>::new(&store, "name").with_codec(Codec::MessagePack);

        key.save(&"blob".to_owned());
        assert_eq!(key.load(None), Some("blob".to_owned()));
    }

    #[test]
    fn external_writes_reach_subscribers_but_saves_do_not() {
        let store = KeyValueStore::new();
        let key = AppStorageKey::<u32>::new(&store, "count");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _subscription = key.subscribe(
            None,
            Box::new(move |value| seen_clone.lock().push(value)),
        );

        key.save(&1);
        store.set_value("count", &2u32, Codec::Json).unwrap();
        store.set("count", b"garbage".to_vec());
        store.remove("count");

        assert_eq!(*seen.lock(), vec![Some(2), None]);
    }

    #[test]
    fn canceled_subscription_stops_listening() {
        let store = KeyValueStore::new();
        let key = AppStorageKey::<u32>::new(&store, "count");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let subscription = key.subscribe(
            None,
            Box::new(move |value| seen_clone.lock().push(value)),
        );
        subscription.cancel();

        store.set_value("count", &7u32, Codec::Json).unwrap();
        assert!(seen.lock().is_empty());
    }
}
