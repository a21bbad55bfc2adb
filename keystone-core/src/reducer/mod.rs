//! Reducer Composition
//!
//! A reducer is the only place a state transition happens: given the current
//! state and an action, it mutates the state in place and returns the
//! [`Effect`] to run afterwards.
//!
//! # Composition
//!
//! Reducers compose by running one after another against the *same* state,
//! so later steps see what earlier steps did, and merging their effects:
//!
//! ```rust,ignore
//! let app = combine_reducers![
//!     Reduce::new(|state: &mut App, action: AppAction| { /* ... */ Effect::none() }),
//!     analytics,
//!     logging,
//! ];
//! ```
//!
//! Branches ([`Conditional`]), optional steps (`Option<R>`) and runtime lists
//! of homogeneous reducers ([`SequenceMany`]) compose the same way.

mod builder;
mod effect;

pub use builder::{Conditional, Sequence, SequenceMany};
pub use effect::{Effect, Operation};

use std::fmt;
use std::marker::PhantomData;

/// A state transition function.
pub trait Reducer {
    /// The state this reducer operates on.
    type State;

    /// The actions it handles.
    type Action;

    /// Apply `action` to `state` and describe the follow-up work.
    fn reduce(&self, state: &mut Self::State, action: Self::Action) -> Effect<Self::Action>;
}

/// A type-erased reducer.
pub type BoxReducer<S, A> = Box<dyn Reducer<State = S, Action = A> + Send + Sync>;

impl<R: Reducer + ?Sized> Reducer for Box<R> {
    type State = R::State;
    type Action = R::Action;

    fn reduce(&self, state: &mut Self::State, action: Self::Action) -> Effect<Self::Action> {
        (**self).reduce(state, action)
    }
}

/// A step that may be absent. `None` leaves the state alone.
impl<R: Reducer> Reducer for Option<R> {
    type State = R::State;
    type Action = R::Action;

    fn reduce(&self, state: &mut Self::State, action: Self::Action) -> Effect<Self::Action> {
        match self {
            Some(reducer) => reducer.reduce(state, action),
            None => Effect::none(),
        }
    }
}

/// A reducer built from a closure.
pub struct Reduce<S, A, F> {
    reduce: F,
    _types: PhantomData<fn(&mut S, A)>,
}

impl<S, A, F> Reduce<S, A, F>
where
    F: Fn(&mut S, A) -> Effect<A>,
{
    pub fn new(reduce: F) -> Self {
        Self {
            reduce,
            _types: PhantomData,
        }
    }
}

impl<S, A, F: Clone> Clone for Reduce<S, A, F> {
    fn clone(&self) -> Self {
        Self {
            reduce: self.reduce.clone(),
            _types: PhantomData,
        }
    }
}

impl<S, A, F> Reducer for Reduce<S, A, F>
where
    F: Fn(&mut S, A) -> Effect<A>,
{
    type State = S;
    type Action = A;

    fn reduce(&self, state: &mut S, action: A) -> Effect<A> {
        (self.reduce)(state, action)
    }
}

impl<S, A, F> fmt::Debug for Reduce<S, A, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reduce")
    }
}

/// A reducer that does nothing.
pub struct EmptyReducer<S, A> {
    _types: PhantomData<fn(&mut S, A)>,
}

impl<S, A> EmptyReducer<S, A> {
    pub fn new() -> Self {
        Self { _types: PhantomData }
    }
}

impl<S, A> Default for EmptyReducer<S, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, A> Clone for EmptyReducer<S, A> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<S, A> fmt::Debug for EmptyReducer<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EmptyReducer")
    }
}

impl<S, A> Reducer for EmptyReducer<S, A> {
    type State = S;
    type Action = A;

    fn reduce(&self, _state: &mut S, _action: A) -> Effect<A> {
        Effect::none()
    }
}

/// Fluent composition for any reducer.
pub trait ReducerExt: Reducer + Sized {
    /// Run `next` after this reducer and merge their effects.
    fn combine<R>(self, next: R) -> Sequence<Self, R>
    where
        R: Reducer<State = Self::State, Action = Self::Action>,
    {
        Sequence::new(self, next)
    }

    /// Erase this reducer's type.
    fn boxed(self) -> BoxReducer<Self::State, Self::Action>
    where
        Self: Send + Sync + 'static,
    {
        Box::new(self)
    }
}

impl<R: Reducer> ReducerExt for R {}

/// Fold reducers into one that runs each in order and merges their effects.
///
/// `combine_reducers![a, b, c]` is `Sequence(Sequence(a, b), c)`. With no
/// arguments it is an [`EmptyReducer`].
#[macro_export]
macro_rules! combine_reducers {
    (@fold $acc:expr; $next:expr) => {
        $crate::reducer::Sequence::new($acc, $next)
    };
    (@fold $acc:expr; $next:expr, $($rest:expr),+) => {
        $crate::combine_reducers!(@fold $crate::reducer::Sequence::new($acc, $next); $($rest),+)
    };
    () => {
        $crate::reducer::EmptyReducer::new()
    };
    ($only:expr $(,)?) => {
        $only
    };
    ($first:expr, $($rest:expr),+ $(,)?) => {
        $crate::combine_reducers!(@fold $first; $($rest),+)
    };
}
