//! In-process key with no backing storage.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{PersistenceId, PersistenceKey, PersistenceReaderKey};

/// A key that stores nothing.
///
/// Every handle created with the same name shares one reference for as long
/// as at least one of them is alive. Once the last one drops, the value is
/// gone and the next request starts again from its default.
pub struct InMemoryKey<V> {
    name: Arc<str>,
    _value: PhantomData<fn() -> V>,
}

impl<V> InMemoryKey<V> {
    /// Create a key identified by `name`.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            _value: PhantomData,
        }
    }
}

impl<V> Clone for InMemoryKey<V> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            _value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for InMemoryKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InMemoryKey").field(&self.name).finish()
    }
}

impl<V: 'static> PersistenceReaderKey<V> for InMemoryKey<V> {
    fn id(&self) -> PersistenceId {
        PersistenceId::new("memory", Arc::clone(&self.name))
    }

    fn load(&self, _initial: Option<&V>) -> Option<V> {
        None
    }
}

impl<V: 'static> PersistenceKey<V> for InMemoryKey<V> {
    fn save(&self, _value: &V) {}
}
