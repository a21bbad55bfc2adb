//! Composite reducers produced by `combine_reducers!` and
//! [`ReducerExt::combine`](super::ReducerExt::combine).

use super::{Effect, Reducer};

/// Two reducers run in order against the same state.
#[derive(Debug, Clone)]
pub struct Sequence<R0, R1> {
    first: R0,
    second: R1,
}

impl<R0, R1> Sequence<R0, R1> {
    pub fn new(first: R0, second: R1) -> Self {
        Self { first, second }
    }
}

impl<R0, R1> Reducer for Sequence<R0, R1>
where
    R0: Reducer,
    R0::Action: Clone,
    R1: Reducer<State = R0::State, Action = R0::Action>,
{
    type State = R0::State;
    type Action = R0::Action;

    fn reduce(&self, state: &mut Self::State, action: Self::Action) -> Effect<Self::Action> {
        let first = self.first.reduce(state, action.clone());
        first.merge(self.second.reduce(state, action))
    }
}

/// Any number of reducers of one type, run in list order.
#[derive(Debug, Clone)]
pub struct SequenceMany<R> {
    reducers: Vec<R>,
}

impl<R> SequenceMany<R> {
    pub fn new(reducers: Vec<R>) -> Self {
        Self { reducers }
    }

    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }
}

impl<R> FromIterator<R> for SequenceMany<R> {
    fn from_iter<I: IntoIterator<Item = R>>(reducers: I) -> Self {
        Self::new(reducers.into_iter().collect())
    }
}

impl<R> Reducer for SequenceMany<R>
where
    R: Reducer,
    R::Action: Clone,
{
    type State = R::State;
    type Action = R::Action;

    fn reduce(&self, state: &mut Self::State, action: Self::Action) -> Effect<Self::Action> {
        self.reducers.iter().fold(Effect::none(), |effect, reducer| {
            effect.merge(reducer.reduce(state, action.clone()))
        })
    }
}

/// Exactly one of two reducers.
#[derive(Debug, Clone)]
pub enum Conditional<R0, R1> {
    First(R0),
    Second(R1),
}

impl<R0, R1> Reducer for Conditional<R0, R1>
where
    R0: Reducer,
    R1: Reducer<State = R0::State, Action = R0::Action>,
{
    type State = R0::State;
    type Action = R0::Action;

    fn reduce(&self, state: &mut Self::State, action: Self::Action) -> Effect<Self::Action> {
        match self {
            Conditional::First(reducer) => reducer.reduce(state, action),
            Conditional::Second(reducer) => reducer.reduce(state, action),
        }
    }
}
