//! Observation Registrar
//!
//! Every reference cell owns a registrar. It is the bridge between the cell
//! and whatever re-renders or recomputes when the cell changes:
//!
//! 1. Reads through a handle call [`ObservationRegistrar::access`], which
//!    records the (reference, key-path) pair in the active tracking scope.
//!
//! 2. Writes through a handle are bracketed by
//!    [`ObservationRegistrar::will_set`] and [`ObservationRegistrar::did_set`],
//!    each called exactly once per write and never while the cell lock is
//!    held.
//!
//! 3. Observers registered with a path filter only hear about writes whose
//!    path overlaps theirs.
//!
//! # Thread Safety
//!
//! The observer table is behind a mutex. Callbacks are collected under the
//! lock and invoked after it is released, so a callback may read the cell,
//! register new observers, or unregister itself.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::context::{Access, TrackingScope};
use super::observer::{paths_overlap, ChangeEvent, ObserverId, Phase};
use crate::shared::ReferenceId;

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Registration {
    /// `None` observes every write.
    path: Option<Arc<str>>,
    callback: Callback,
}

/// Observer table for one reference.
///
/// Cloning shares the table.
#[derive(Clone, Default)]
pub struct ObservationRegistrar {
    observers: Arc<Mutex<IndexMap<ObserverId, Registration>>>,
}

impl ObservationRegistrar {
    /// Create an empty registrar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for will/did-change events.
    ///
    /// With a `path`, only writes overlapping that key-path are delivered.
    /// Callbacks run in registration order.
    pub fn register<F>(&self, path: Option<Arc<str>>, callback: F) -> ObserverId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = ObserverId::new();
        self.observers.lock().insert(
            id,
            Registration {
                path,
                callback: Arc::new(callback),
            },
        );
        id
    }

    /// Like [`register`](Self::register), but unregisters when the returned
    /// token is dropped.
    pub fn observe<F>(&self, path: Option<Arc<str>>, callback: F) -> Observation
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.register(path, callback);
        Observation {
            registrar: self.clone(),
            id,
        }
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unregister(&self, id: ObserverId) {
        self.observers.lock().shift_remove(&id);
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Record a read of `path` for the active tracking scope, if any.
    pub(crate) fn access(&self, reference: ReferenceId, path: &Arc<str>) {
        if TrackingScope::is_active() {
            TrackingScope::record(Access {
                reference,
                path: Arc::clone(path),
                registrar: self.clone(),
            });
        }
    }

    pub(crate) fn will_set(&self, reference: ReferenceId, path: &Arc<str>) {
        self.notify(&ChangeEvent {
            reference,
            path: Arc::clone(path),
            phase: Phase::WillChange,
        });
    }

    pub(crate) fn did_set(&self, reference: ReferenceId, path: &Arc<str>) {
        self.notify(&ChangeEvent {
            reference,
            path: Arc::clone(path),
            phase: Phase::DidChange,
        });
    }

    fn notify(&self, event: &ChangeEvent) {
        let callbacks: SmallVec<[Callback; 4]> = {
            let observers = self.observers.lock();
            observers
                .values()
                .filter(|registration| match &registration.path {
                    Some(path) => paths_overlap(path, &event.path),
                    None => true,
                })
                .map(|registration| Arc::clone(&registration.callback))
                .collect()
        };

        // Lock released before running callbacks
        for callback in callbacks {
            callback(event);
        }
    }
}

impl std::fmt::Debug for ObservationRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationRegistrar")
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Token for a registered observer.
///
/// Dropping this token unregisters the observer.
#[must_use = "dropping an Observation unregisters it immediately"]
pub struct Observation {
    registrar: ObservationRegistrar,
    id: ObserverId,
}

impl Observation {
    /// The id of the underlying registration.
    pub fn id(&self) -> ObserverId {
        self.id
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.registrar.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::with_observation_tracking;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&ChangeEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        (count, move |_: &ChangeEvent| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn registrar_brackets_writes() {
        let registrar = ObservationRegistrar::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let _observation = registrar.observe(None, move |event| {
            events_clone.lock().push(event.phase);
        });

        let reference = ReferenceId::new();
        registrar.will_set(reference, &Arc::from(""));
        registrar.did_set(reference, &Arc::from(""));

        assert_eq!(*events.lock(), vec![Phase::WillChange, Phase::DidChange]);
    }

    #[test]
    fn registrar_filters_by_path() {
        let registrar = ObservationRegistrar::new();
        let (count, callback) = counter();
        let _observation = registrar.observe(Some(Arc::from("a")), callback);

        let reference = ReferenceId::new();
        registrar.will_set(reference, &Arc::from("b"));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        registrar.will_set(reference, &Arc::from("a.x"));
        registrar.will_set(reference, &Arc::from(""));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_observation_unregisters() {
        let registrar = ObservationRegistrar::new();
        let (count, callback) = counter();

        let observation = registrar.observe(None, callback);
        assert_eq!(registrar.observer_count(), 1);
        drop(observation);
        assert_eq!(registrar.observer_count(), 0);

        registrar.will_set(ReferenceId::new(), &Arc::from(""));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tracking_fires_once_and_cleans_up() {
        let registrar = ObservationRegistrar::new();
        let reference = ReferenceId::new();
        let path: Arc<str> = Arc::from("title");
        let (count, _) = counter();
        let count_clone = count.clone();

        let value = with_observation_tracking(
            || {
                registrar.access(reference, &path);
                7
            },
            move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(value, 7);
        assert_eq!(registrar.observer_count(), 1);

        registrar.will_set(reference, &Arc::from("body"));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        registrar.will_set(reference, &path);
        registrar.did_set(reference, &path);
        registrar.will_set(reference, &path);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registrar.observer_count(), 0);
    }

    #[test]
    fn untracked_access_records_nothing() {
        let registrar = ObservationRegistrar::new();
        registrar.access(ReferenceId::new(), &Arc::from(""));
        assert_eq!(registrar.observer_count(), 0);
    }
}
