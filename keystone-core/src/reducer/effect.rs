//! Effects
//!
//! An [`Effect`] describes work a reducer wants done after a state
//! transition. It is a value: nothing runs until the caller decides to run it.
//!
//! Merging effects concatenates their operations. The merged effect means
//! "run all of these"; no completion order between them is promised.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};

/// One unit of work inside an [`Effect`].
pub enum Operation<A> {
    /// Feed an action back immediately.
    Send(A),
    /// Run a future that resolves to an action.
    Run(BoxFuture<'static, A>),
}

impl<A: fmt::Debug> fmt::Debug for Operation<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Send(action) => f.debug_tuple("Send").field(action).finish(),
            Operation::Run(_) => f.write_str("Run(..)"),
        }
    }
}

/// Work produced by a reducer, yielding actions of type `A`.
#[must_use = "an effect does nothing unless it is returned or run"]
pub struct Effect<A> {
    operations: Vec<Operation<A>>,
}

impl<A> Effect<A> {
    /// An effect that does nothing.
    pub fn none() -> Self {
        Self {
            operations: Vec::new(),
        }
    }

    /// An effect that immediately yields `action`.
    pub fn send(action: A) -> Self {
        Self {
            operations: vec![Operation::Send(action)],
        }
    }

    /// An effect that runs `future` and yields its output.
    pub fn run<F>(future: F) -> Self
    where
        F: Future<Output = A> + Send + 'static,
    {
        Self {
            operations: vec![Operation::Run(future.boxed())],
        }
    }

    /// Combine with another effect. Both run; neither waits for the other.
    pub fn merge(mut self, other: Self) -> Self {
        self.operations.extend(other.operations);
        self
    }

    /// Combine any number of effects.
    pub fn merge_all(effects: impl IntoIterator<Item = Self>) -> Self {
        effects.into_iter().fold(Self::none(), Self::merge)
    }

    /// Whether this effect does nothing.
    pub fn is_none(&self) -> bool {
        self.operations.is_empty()
    }

    /// The operations, in merge order.
    pub fn operations(&self) -> &[Operation<A>] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation<A>> {
        self.operations
    }

    /// Actions this effect sends without running anything.
    pub fn immediate_actions(&self) -> impl Iterator<Item = &A> {
        self.operations.iter().filter_map(|operation| match operation {
            Operation::Send(action) => Some(action),
            Operation::Run(_) => None,
        })
    }

    /// Transform every action this effect yields.
    pub fn map<B, F>(self, transform: F) -> Effect<B>
    where
        A: Send + 'static,
        B: 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let transform = Arc::new(transform);
        let operations = self
            .operations
            .into_iter()
            .map(|operation| match operation {
                Operation::Send(action) => Operation::Send(transform(action)),
                Operation::Run(future) => {
                    let transform = Arc::clone(&transform);
                    Operation::Run(future.map(move |action| transform(action)).boxed())
                }
            })
            .collect();
        Effect { operations }
    }
}

impl<A: Send + 'static> Effect<A> {
    /// Run every operation concurrently and collect the actions they yield.
    ///
    /// Actions come back in merge order, though the operations themselves may
    /// finish in any order.
    pub async fn run_all(self) -> Vec<A> {
        let futures = self.operations.into_iter().map(|operation| match operation {
            Operation::Send(action) => future::ready(action).boxed(),
            Operation::Run(future) => future,
        });
        future::join_all(futures).await
    }
}

impl<A> Default for Effect<A> {
    fn default() -> Self {
        Self::none()
    }
}

impl<A> FromIterator<Effect<A>> for Effect<A> {
    fn from_iter<I: IntoIterator<Item = Effect<A>>>(effects: I) -> Self {
        Self::merge_all(effects)
    }
}

impl<A: fmt::Debug> fmt::Debug for Effect<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.operations).finish()
    }
}
