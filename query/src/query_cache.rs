use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use slotmap::SlotMap;

use crate::{
    cache_observer::{CacheObserver, QueryCacheEvent},
    environment::Environment,
    filters::QueryFilters,
    hydration::DehydratedQuery,
    query::{AnyQuery, Query},
    query_options::DefaultedQueryOptions,
    FetchError, QueryError, QueryValue,
};

slotmap::new_key_type! {
    /// Handle of a cache-level listener.
    pub struct CacheObserverKey;
}

/// Callbacks run for every query in a cache, after the query's own state was updated.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
    /// A fetch failed for good.
    pub on_error: Option<Rc<dyn Fn(&FetchError, &dyn AnyQuery)>>,
    /// A fetch succeeded.
    pub on_success: Option<Rc<dyn Fn(&dyn AnyQuery)>>,
    /// A fetch succeeded or failed for good.
    pub on_settled: Option<Rc<dyn Fn(Option<&FetchError>, &dyn AnyQuery)>>,
}

/// Registry of queries keyed by hash.
#[derive(Clone)]
pub struct QueryCache {
    inner: Rc<QueryCacheInner>,
}

struct QueryCacheInner {
    queries: RefCell<HashMap<String, Rc<dyn AnyQuery>>>,
    // Insertion order of `queries`.
    order: RefCell<Vec<String>>,
    stash: RefCell<HashMap<String, DehydratedQuery>>,
    observers: RefCell<SlotMap<CacheObserverKey, Rc<dyn CacheObserver<QueryCacheEvent>>>>,
    config: QueryCacheConfig,
    env: Environment,
}

/// Non-owning handle held by queries.
#[derive(Clone)]
pub(crate) struct WeakQueryCache(Weak<QueryCacheInner>);

impl WeakQueryCache {
    pub(crate) fn upgrade(&self) -> Option<QueryCache> {
        self.0.upgrade().map(|inner| QueryCache { inner })
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(QueryCacheConfig::default(), Environment::default())
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &*self.inner.order.borrow())
            .finish()
    }
}

impl QueryCache {
    /// Creates an empty cache.
    pub fn new(config: QueryCacheConfig, env: Environment) -> Self {
        Self {
            inner: Rc::new(QueryCacheInner {
                queries: RefCell::new(HashMap::new()),
                order: RefCell::new(Vec::new()),
                stash: RefCell::new(HashMap::new()),
                observers: RefCell::new(SlotMap::with_key()),
                config,
                env,
            }),
        }
    }

    pub(crate) fn environment(&self) -> &Environment {
        &self.inner.env
    }

    fn downgrade(&self) -> WeakQueryCache {
        WeakQueryCache(Rc::downgrade(&self.inner))
    }

    /// Finds the query for `options.query_hash`, or creates it.
    ///
    /// Fails with [`QueryError::TypeMismatch`] when the hash is cached with another value type.
    pub fn build<V: QueryValue>(&self, options: DefaultedQueryOptions<V>) -> Result<Query<V>, QueryError> {
        if let Some(existing) = self.get(&options.query_hash) {
            return downcast(existing.as_ref());
        }

        let query = Query::new(options, self.downgrade(), self.inner.env.clone());
        self.add(query.erased());

        let stashed = self.inner.stash.borrow_mut().remove(query.hash());
        if let Some(stashed) = stashed {
            tracing::debug!(query_hash = %query.hash(), "materializing hydrated query");
            query.hydrate(&stashed.state, true)?;
        }
        Ok(query)
    }

    fn add(&self, query: Rc<dyn AnyQuery>) {
        let hash = query.query_hash().to_string();
        let inserted = {
            let mut queries = self.inner.queries.borrow_mut();
            if queries.contains_key(&hash) {
                false
            } else {
                queries.insert(hash.clone(), query.clone());
                self.inner.order.borrow_mut().push(hash);
                true
            }
        };
        if inserted {
            self.notify(QueryCacheEvent::Added(query));
        }
    }

    /// Removes `query` if it is still the registered instance for its hash.
    pub fn remove(&self, query: &dyn AnyQuery) {
        let removed = {
            let mut queries = self.inner.queries.borrow_mut();
            match queries.get(query.query_hash()) {
                Some(registered) if registered.id() == query.id() => {
                    self.inner
                        .order
                        .borrow_mut()
                        .retain(|hash| hash != query.query_hash());
                    queries.remove(query.query_hash())
                }
                _ => None,
            }
        };
        if let Some(removed) = removed {
            removed.destroy();
            self.notify(QueryCacheEvent::Removed(removed));
        }
    }

    /// Removes every query.
    pub fn clear(&self) {
        self.inner.env.notify.batch(|| {
            for query in self.get_all() {
                self.remove(query.as_ref());
            }
        });
        self.inner.stash.borrow_mut().clear();
    }

    /// The query registered for `query_hash`.
    pub fn get(&self, query_hash: &str) -> Option<Rc<dyn AnyQuery>> {
        self.inner.queries.borrow().get(query_hash).cloned()
    }

    /// The typed query registered for `query_hash`.
    pub fn get_query<V: QueryValue>(&self, query_hash: &str) -> Result<Option<Query<V>>, QueryError> {
        self.get(query_hash)
            .map(|query| downcast(query.as_ref()))
            .transpose()
    }

    /// Every query, in insertion order.
    pub fn get_all(&self) -> Vec<Rc<dyn AnyQuery>> {
        let queries = self.inner.queries.borrow();
        self.inner
            .order
            .borrow()
            .iter()
            .filter_map(|hash| queries.get(hash).cloned())
            .collect()
    }

    /// The first query matching `filters`.
    pub fn find(&self, filters: &QueryFilters) -> Option<Rc<dyn AnyQuery>> {
        self.get_all()
            .into_iter()
            .find(|query| filters.matches(query.as_ref()))
    }

    /// Every query matching `filters`.
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Rc<dyn AnyQuery>> {
        self.get_all()
            .into_iter()
            .filter(|query| filters.matches(query.as_ref()))
            .collect()
    }

    /// Registers a cache-level listener.
    pub fn subscribe(&self, observer: impl CacheObserver<QueryCacheEvent> + 'static) -> CacheObserverKey {
        self.inner.observers.borrow_mut().insert(Rc::new(observer))
    }

    /// Removes a cache-level listener.
    pub fn unsubscribe(&self, key: CacheObserverKey) -> bool {
        self.inner.observers.borrow_mut().remove(key).is_some()
    }

    pub(crate) fn notify(&self, event: QueryCacheEvent) {
        let observers: Vec<_> = self.inner.observers.borrow().values().cloned().collect();
        if observers.is_empty() {
            return;
        }
        self.inner.env.notify.batch(|| {
            for observer in observers {
                observer.process_cache_event(event.clone());
            }
        });
    }

    /// Lets every query react to the window regaining focus.
    pub fn on_focus(&self) {
        self.inner.env.notify.batch(|| {
            for query in self.get_all() {
                query.on_focus();
            }
        });
    }

    /// Lets every query react to connectivity coming back.
    pub fn on_online(&self) {
        self.inner.env.notify.batch(|| {
            for query in self.get_all() {
                query.on_online();
            }
        });
    }

    pub(crate) fn on_success(&self, query: &dyn AnyQuery) {
        if let Some(on_success) = &self.inner.config.on_success {
            on_success(query);
        }
        if let Some(on_settled) = &self.inner.config.on_settled {
            on_settled(None, query);
        }
    }

    pub(crate) fn on_error(&self, error: &FetchError, query: &dyn AnyQuery) {
        if let Some(on_error) = &self.inner.config.on_error {
            on_error(error, query);
        }
        if let Some(on_settled) = &self.inner.config.on_settled {
            on_settled(Some(error), query);
        }
    }

    pub(crate) fn stash(&self, query: DehydratedQuery) {
        let mut stash = self.inner.stash.borrow_mut();
        let newer = stash
            .get(&query.query_hash)
            .map_or(true, |existing| query.state.data_updated_at > existing.state.data_updated_at);
        if newer {
            stash.insert(query.query_hash.clone(), query);
        }
    }

    pub(crate) fn stashed(&self) -> Vec<DehydratedQuery> {
        self.inner.stash.borrow().values().cloned().collect()
    }

    pub(crate) fn unstash(&self, query_hash: &str) -> bool {
        self.inner.stash.borrow_mut().remove(query_hash).is_some()
    }
}

fn downcast<V: QueryValue>(query: &dyn AnyQuery) -> Result<Query<V>, QueryError> {
    query
        .as_any()
        .downcast_ref::<Query<V>>()
        .cloned()
        .ok_or_else(|| QueryError::TypeMismatch {
            query_hash: query.query_hash().to_string(),
        })
}
