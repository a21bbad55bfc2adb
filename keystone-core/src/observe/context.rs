//! Observation Tracking Context
//!
//! The tracking context records which references (and which key-paths into
//! them) a computation reads. A UI layer wraps its render function in a
//! tracking scope, then subscribes to exactly the paths that were read.
//!
//! # Implementation
//!
//! We use a thread-local stack of scopes. Entering a scope pushes an empty
//! access list; reads made by shared handles append to the innermost list;
//! dropping the guard pops it. Nested scopes are independent: an inner scope's
//! accesses are not reported to the outer one.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::registrar::ObservationRegistrar;
use super::observer::{ChangeEvent, ObserverId, Phase};
use crate::shared::ReferenceId;

thread_local! {
    static TRACKING_STACK: RefCell<Vec<Vec<Access>>> = const { RefCell::new(Vec::new()) };
}

/// One recorded read.
#[derive(Clone)]
pub struct Access {
    pub reference: ReferenceId,
    pub path: Arc<str>,
    pub(crate) registrar: ObservationRegistrar,
}

impl Access {
    fn same_target(&self, other: &Access) -> bool {
        self.reference == other.reference && self.path == other.path
    }
}

impl std::fmt::Debug for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Access")
            .field("reference", &self.reference)
            .field("path", &self.path)
            .finish()
    }
}

/// Guard that pops the tracking scope when dropped.
///
/// This keeps the stack balanced even if the tracked computation panics.
pub struct TrackingScope {
    depth: usize,
}

impl TrackingScope {
    /// Start recording accesses on this thread.
    pub fn enter() -> Self {
        let depth = TRACKING_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(Vec::new());
            stack.len()
        });
        Self { depth }
    }

    /// Check if there is an active tracking scope.
    pub fn is_active() -> bool {
        TRACKING_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// Record a read into the innermost scope. Repeated reads of the same
    /// target are recorded once.
    pub(crate) fn record(access: Access) {
        TRACKING_STACK.with(|stack| {
            if let Some(accesses) = stack.borrow_mut().last_mut() {
                if !accesses.iter().any(|existing| existing.same_target(&access)) {
                    accesses.push(access);
                }
            }
        });
    }

    /// The accesses recorded so far in this scope.
    pub fn accesses(&self) -> Vec<Access> {
        TRACKING_STACK.with(|stack| {
            stack
                .borrow()
                .get(self.depth - 1)
                .cloned()
                .unwrap_or_default()
        })
    }
}

impl Drop for TrackingScope {
    fn drop(&mut self) {
        TRACKING_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(
                stack.len(),
                self.depth,
                "TrackingScope dropped out of order"
            );
            stack.pop();
        });
    }
}

type PendingChange = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;

/// Run `apply`, then call `on_change` once, the first time anything it read is
/// about to change.
///
/// Only the (reference, key-path) pairs `apply` actually read are observed, and
/// writes elsewhere in the same reference do not fire. After firing, every
/// registration made here is removed.
///
/// ```rust,ignore
/// let title = with_observation_tracking(
///     || settings.get().title,
///     move || needs_render.store(true, Ordering::SeqCst),
/// );
/// ```
pub fn with_observation_tracking<R, F>(apply: impl FnOnce() -> R, on_change: F) -> R
where
    F: FnOnce() + Send + 'static,
{
    let (result, accesses) = {
        let scope = TrackingScope::enter();
        let result = apply();
        (result, scope.accesses())
    };

    if accesses.is_empty() {
        return result;
    }

    let on_change: Box<dyn FnOnce() + Send> = Box::new(on_change);
    let pending: PendingChange = Arc::new(Mutex::new(Some(on_change)));
    let registrations: Arc<Mutex<SmallVec<[(ObservationRegistrar, ObserverId); 4]>>> =
        Arc::new(Mutex::new(SmallVec::new()));

    for access in accesses {
        let pending = Arc::clone(&pending);
        let registrations_for_callback = Arc::clone(&registrations);
        let id = access.registrar.register(Some(access.path.clone()), move |event: &ChangeEvent| {
            if event.phase != Phase::WillChange {
                return;
            }
            let Some(on_change) = pending.lock().take() else { return };
            for (registrar, id) in registrations_for_callback.lock().drain(..) {
                registrar.unregister(id);
            }
            on_change();
        });
        registrations.lock().push((access.registrar, id));
    }

    // A change on another thread may have fired before every registration
    // was recorded.
    if pending.lock().is_none() {
        for (registrar, id) in registrations.lock().drain(..) {
            registrar.unregister(id);
        }
    }

    result
}
