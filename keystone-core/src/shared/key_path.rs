//! Key-Paths
//!
//! A key-path describes how to reach a part of a value. Shared handles store
//! one to project the reference's root value down to the part they expose.
//!
//! # Representation
//!
//! Paths are pairs of closures captured as values:
//!
//! - a reader, `Fn(&Root, &mut dyn FnMut(&V))`, that visits the target;
//! - for [`WritableKeyPath`], a writer, `Fn(&mut Root, &mut dyn FnMut(&mut V))`,
//!   that hands out the target mutably.
//!
//! Visitor style rather than `Fn(&Root) -> &V` lets a path substitute a value
//! that is not stored in the root at all, which is how default-substituted
//! paths over optionals and collection indexes work.
//!
//! Composition is closure composition: `a.appending(&b)` visits `a`'s target
//! and then visits `b` inside it.
//!
//! # Names
//!
//! Every path carries a name (`"profile.email"`, `"items[3]"`, `""` for the
//! identity). Names drive observation filtering and show up in diagnostics.

use std::fmt;
use std::sync::Arc;

type Reader<Root, V> = Arc<dyn Fn(&Root, &mut dyn FnMut(&V)) + Send + Sync>;
type Writer<Root, V> = Arc<dyn Fn(&mut Root, &mut dyn FnMut(&mut V)) + Send + Sync>;

pub(crate) fn join_names(head: &str, tail: &str) -> Arc<str> {
    if head.is_empty() {
        Arc::from(tail)
    } else if tail.is_empty() {
        Arc::from(head)
    } else if tail.starts_with('[') {
        Arc::from(format!("{head}{tail}"))
    } else {
        Arc::from(format!("{head}.{tail}"))
    }
}

/// A read-only path from `Root` to `V`.
pub struct KeyPath<Root, V> {
    name: Arc<str>,
    /// Set when the target is computed rather than stored in the root.
    computed: bool,
    read: Reader<Root, V>,
}

impl<Root, V> Clone for KeyPath<Root, V> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            computed: self.computed,
            read: Arc::clone(&self.read),
        }
    }
}

impl<Root, V> fmt::Debug for KeyPath<Root, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyPath").field(&self.name).finish()
    }
}

impl<Root: 'static> KeyPath<Root, Root> {
    /// The path from a value to itself.
    pub fn identity() -> Self {
        Self {
            name: Arc::from(""),
            computed: false,
            read: Arc::new(|root: &Root, visit: &mut dyn FnMut(&Root)| visit(root)),
        }
    }
}

impl<Root: 'static, V: 'static> KeyPath<Root, V> {
    /// A path to a stored part of `Root`.
    pub fn new<G>(name: &str, get: G) -> Self
    where
        G: Fn(&Root) -> &V + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            computed: false,
            read: Arc::new(move |root: &Root, visit: &mut dyn FnMut(&V)| visit(get(root))),
        }
    }

    /// A computed view of `Root`. Only readers can use these.
    ///
    /// A computed target may depend on any part of the root, so readers
    /// projected through one observe every write to the root.
    pub fn derived<F>(name: &str, compute: F) -> Self
    where
        F: Fn(&Root) -> V + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            computed: true,
            read: Arc::new(move |root: &Root, visit: &mut dyn FnMut(&V)| {
                let value = compute(root);
                visit(&value);
            }),
        }
    }

    /// The path's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn is_computed(&self) -> bool {
        self.computed
    }

    /// Visit the target inside `root`.
    pub fn visit(&self, root: &Root, visit: &mut dyn FnMut(&V)) {
        (self.read)(root, visit);
    }

    /// Read a copy of the target.
    ///
    /// # Panics
    ///
    /// Panics if the path does not resolve against `root`, which means it was
    /// built incorrectly.
    pub fn get(&self, root: &Root) -> V
    where
        V: Clone,
    {
        let mut out = None;
        self.visit(root, &mut |value: &V| out = Some(value.clone()));
        match out {
            Some(value) => value,
            None => panic!("key path `{}` did not resolve against its root", self.name),
        }
    }

    /// Extend this path with another one starting at `V`.
    pub fn appending<M: 'static>(&self, next: &KeyPath<V, M>) -> KeyPath<Root, M> {
        let outer = Arc::clone(&self.read);
        let inner = Arc::clone(&next.read);
        KeyPath {
            name: join_names(&self.name, &next.name),
            computed: self.computed || next.computed,
            read: Arc::new(move |root: &Root, visit: &mut dyn FnMut(&M)| {
                outer(root, &mut |value: &V| inner(value, &mut *visit));
            }),
        }
    }
}

impl<Root: 'static, M> KeyPath<Root, Option<M>>
where
    M: Clone + Send + Sync + 'static,
{
    /// Unwrap the optional target, reading `default` while it is absent.
    pub fn or_default(&self, default: M) -> KeyPath<Root, M> {
        let read = Arc::clone(&self.read);
        KeyPath {
            name: Arc::clone(&self.name),
            computed: self.computed,
            read: Arc::new(move |root: &Root, visit: &mut dyn FnMut(&M)| {
                read(root, &mut |value: &Option<M>| match value {
                    Some(value) => visit(value),
                    None => visit(&default),
                });
            }),
        }
    }
}

impl<C, T> KeyPath<C, T>
where
    C: AsRef<[T]> + 'static,
    T: Send + Sync + 'static,
{
    /// The element at `index`, reading `default` once the index is out of
    /// bounds.
    pub fn index(index: usize, default: T) -> Self {
        Self {
            name: Arc::from(format!("[{index}]")),
            computed: false,
            read: Arc::new(move |collection: &C, visit: &mut dyn FnMut(&T)| {
                match collection.as_ref().get(index) {
                    Some(element) => visit(element),
                    None => visit(&default),
                }
            }),
        }
    }
}

/// A path from `Root` to `V` that can also write.
pub struct WritableKeyPath<Root, V> {
    path: KeyPath<Root, V>,
    write: Writer<Root, V>,
}

impl<Root, V> Clone for WritableKeyPath<Root, V> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            write: Arc::clone(&self.write),
        }
    }
}

impl<Root, V> fmt::Debug for WritableKeyPath<Root, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WritableKeyPath").field(&self.path.name).finish()
    }
}

impl<Root: 'static> WritableKeyPath<Root, Root> {
    /// The path from a value to itself.
    pub fn identity() -> Self {
        Self {
            path: KeyPath::identity(),
            write: Arc::new(|root: &mut Root, modify: &mut dyn FnMut(&mut Root)| modify(root)),
        }
    }
}

impl<Root: 'static, V: 'static> WritableKeyPath<Root, V> {
    /// A path to a stored part of `Root`. See also [`key_path!`](crate::key_path).
    pub fn new<G, M>(name: &str, get: G, get_mut: M) -> Self
    where
        G: Fn(&Root) -> &V + Send + Sync + 'static,
        M: Fn(&mut Root) -> &mut V + Send + Sync + 'static,
    {
        Self {
            path: KeyPath::new(name, get),
            write: Arc::new(move |root: &mut Root, modify: &mut dyn FnMut(&mut V)| {
                modify(get_mut(root))
            }),
        }
    }

    /// The path's name.
    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        self.path.name_arc()
    }

    /// The read-only half of this path.
    pub fn reader(&self) -> KeyPath<Root, V> {
        self.path.clone()
    }

    /// Visit the target inside `root`.
    pub fn visit(&self, root: &Root, visit: &mut dyn FnMut(&V)) {
        self.path.visit(root, visit);
    }

    /// Read a copy of the target. Panics like [`KeyPath::get`].
    pub fn get(&self, root: &Root) -> V
    where
        V: Clone,
    {
        self.path.get(root)
    }

    /// Mutate the target inside `root` in place.
    pub fn modify(&self, root: &mut Root, modify: &mut dyn FnMut(&mut V)) {
        (self.write)(root, modify);
    }

    /// Replace the target inside `root`.
    pub fn set(&self, root: &mut Root, value: V) {
        let mut value = Some(value);
        self.modify(root, &mut |slot: &mut V| {
            if let Some(value) = value.take() {
                *slot = value;
            }
        });
    }

    /// Extend this path with another one starting at `V`.
    pub fn appending<M: 'static>(&self, next: &WritableKeyPath<V, M>) -> WritableKeyPath<Root, M> {
        let outer = Arc::clone(&self.write);
        let inner = Arc::clone(&next.write);
        WritableKeyPath {
            path: self.path.appending(&next.path),
            write: Arc::new(move |root: &mut Root, modify: &mut dyn FnMut(&mut M)| {
                outer(root, &mut |value: &mut V| inner(value, &mut *modify));
            }),
        }
    }
}

impl<Root: 'static, M> WritableKeyPath<Root, Option<M>>
where
    M: Clone + Send + Sync + 'static,
{
    /// Unwrap the optional target, substituting `default` while it is absent.
    ///
    /// Writing while the target is absent stores `Some` of the written value.
    pub fn or_default(&self, default: M) -> WritableKeyPath<Root, M> {
        let write = Arc::clone(&self.write);
        let fallback = default.clone();
        WritableKeyPath {
            path: self.path.or_default(default),
            write: Arc::new(move |root: &mut Root, modify: &mut dyn FnMut(&mut M)| {
                write(root, &mut |slot: &mut Option<M>| match slot {
                    Some(value) => modify(value),
                    None => {
                        let mut value = fallback.clone();
                        modify(&mut value);
                        *slot = Some(value);
                    }
                });
            }),
        }
    }
}

impl<C, T> WritableKeyPath<C, T>
where
    C: AsRef<[T]> + AsMut<[T]> + 'static,
    T: Send + Sync + 'static,
{
    /// The element at `index`, reading `default` once the index is out of
    /// bounds. Writes to an out-of-bounds index are dropped.
    pub fn index(index: usize, default: T) -> Self {
        Self {
            path: KeyPath::index(index, default),
            write: Arc::new(move |collection: &mut C, modify: &mut dyn FnMut(&mut T)| {
                let elements = collection.as_mut();
                let len = elements.len();
                match elements.get_mut(index) {
                    Some(element) => modify(element),
                    None => tracing::warn!(index, len, "dropped write through a stale index"),
                }
            }),
        }
    }
}

/// Build a [`WritableKeyPath`] to a (possibly nested) field.
///
/// ```rust,ignore
/// let email = key_path!(Settings, profile.email);
/// assert_eq!(email.name(), "profile.email");
/// ```
#[macro_export]
macro_rules! key_path {
    ($root:ty, $($field:tt).+) => {
        $crate::WritableKeyPath::<$root, _>::new(
            &[$(stringify!($field)),+].join("."),
            |root: &$root| &root.$($field).+,
            |root: &mut $root| &mut root.$($field).+,
        )
    };
}
