use std::rc::Rc;

use crate::{
    mutation::{AnyMutation, MutationActionKind},
    query::AnyQuery,
    query_state::ActionKind,
};

/// Subscribing to cache events.
pub trait CacheObserver<E = QueryCacheEvent> {
    /// Receive a cache event.
    fn process_cache_event(&self, event: E);
}

impl<E, F> CacheObserver<E> for F
where
    F: Fn(E),
{
    fn process_cache_event(&self, event: E) {
        self(event)
    }
}

/// The events that can be observed from the query cache.
#[derive(Debug, Clone)]
pub enum QueryCacheEvent {
    /// A query was built and registered.
    Added(Rc<dyn AnyQuery>),
    /// A query was removed, explicitly or by garbage collection.
    Removed(Rc<dyn AnyQuery>),
    /// A query's state changed.
    Updated {
        /// The query.
        query: Rc<dyn AnyQuery>,
        /// The transition that was applied.
        action: ActionKind,
    },
    /// An observer bound to a query.
    ObserverAdded(Rc<dyn AnyQuery>),
    /// An observer unbound from a query.
    ObserverRemoved(Rc<dyn AnyQuery>),
    /// An observer recomputed its result.
    ObserverResultsUpdated(Rc<dyn AnyQuery>),
    /// An observer changed its options.
    ObserverOptionsUpdated(Rc<dyn AnyQuery>),
}

impl QueryCacheEvent {
    /// The query the event is about.
    pub fn query(&self) -> &Rc<dyn AnyQuery> {
        match self {
            QueryCacheEvent::Added(query)
            | QueryCacheEvent::Removed(query)
            | QueryCacheEvent::Updated { query, .. }
            | QueryCacheEvent::ObserverAdded(query)
            | QueryCacheEvent::ObserverRemoved(query)
            | QueryCacheEvent::ObserverResultsUpdated(query)
            | QueryCacheEvent::ObserverOptionsUpdated(query) => query,
        }
    }
}

/// The events that can be observed from the mutation cache.
#[derive(Debug, Clone)]
pub enum MutationCacheEvent {
    /// A mutation was registered.
    Added(Rc<dyn AnyMutation>),
    /// A mutation was removed.
    Removed(Rc<dyn AnyMutation>),
    /// A mutation's state changed.
    Updated {
        /// The mutation.
        mutation: Rc<dyn AnyMutation>,
        /// The transition that was applied.
        action: MutationActionKind,
    },
    /// An observer bound to a mutation.
    ObserverAdded(Rc<dyn AnyMutation>),
    /// An observer unbound from a mutation.
    ObserverRemoved(Rc<dyn AnyMutation>),
}

impl MutationCacheEvent {
    /// The mutation the event is about.
    pub fn mutation(&self) -> &Rc<dyn AnyMutation> {
        match self {
            MutationCacheEvent::Added(mutation)
            | MutationCacheEvent::Removed(mutation)
            | MutationCacheEvent::Updated { mutation, .. }
            | MutationCacheEvent::ObserverAdded(mutation)
            | MutationCacheEvent::ObserverRemoved(mutation) => mutation,
        }
    }
}
