use std::{
    any::Any,
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
};

use futures::{
    future::{self, LocalBoxFuture, Shared},
    FutureExt,
};

use crate::{
    cache_observer::QueryCacheEvent,
    environment::Environment,
    garbage_collector::GarbageCollector,
    hydration::{DehydratedQuery, DehydratedQueryState},
    infinite_query::FetchContext,
    query_cache::WeakQueryCache,
    query_options::{DefaultedQueryOptions, GcTime, Meta, QueryFunctionContext, StaleTime},
    query_state::{Action, ActionKind, FetchMeta, FetchStatus, QueryState, QueryStatus},
    retryer::{can_fetch, CancelOptions, CancelSignal, Retryer, RetryerConfig},
    util::spawn_local,
    FetchError, Instant, QueryError, QueryKey, QueryValue,
};

/// Shared outcome of one fetch.
pub(crate) type QueryPromise<V> = Shared<LocalBoxFuture<'static, Result<V, QueryError>>>;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of one query instance. A query evicted and rebuilt gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ObserverKey(u64);

pub(crate) fn next_observer_key() -> ObserverKey {
    ObserverKey(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Callbacks from a query into the observers bound to it.
pub(crate) trait QueryListener {
    fn on_query_update(&self);
    fn should_fetch_on_window_focus(&self) -> bool;
    fn should_fetch_on_reconnect(&self) -> bool;
    fn refetch_in_background(&self);
    fn is_enabled(&self) -> bool;
    fn is_stale(&self) -> bool;
}

/// Options for a single fetch call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Cancel an in-flight fetch (when data exists) instead of joining it.
    pub cancel_refetch: bool,
    /// Extra information passed to the fetch behavior.
    pub meta: Option<FetchMeta>,
}

/// Type-erased view of a [`Query`], used by caches, filters and cache listeners.
pub trait AnyQuery {
    /// Unique instance id.
    fn id(&self) -> QueryId;
    /// Canonical hash.
    fn query_hash(&self) -> &str;
    /// Key the query was built with.
    fn query_key(&self) -> &QueryKey;
    /// Data status.
    fn status(&self) -> QueryStatus;
    /// Fetch status.
    fn fetch_status(&self) -> FetchStatus;
    /// When data was last updated.
    fn data_updated_at(&self) -> Option<Instant>;
    /// Whether data is cached.
    fn has_data(&self) -> bool;
    /// Last error.
    fn error(&self) -> Option<FetchError>;
    /// Failed attempts of the current or last fetch.
    fn fetch_failure_count(&self) -> u32;
    /// Whether the query was invalidated since its last update.
    fn is_invalidated(&self) -> bool;
    /// Number of bound observers.
    fn observer_count(&self) -> usize;
    /// Whether any bound observer is enabled.
    fn is_active(&self) -> bool;
    /// Whether the query should be skipped by bulk refetches.
    fn is_disabled(&self) -> bool;
    /// Whether data never goes stale.
    fn is_static(&self) -> bool;
    /// Staleness as seen by observers, or by invalidation when unobserved.
    fn is_stale(&self) -> bool;
    /// Staleness for a given stale time.
    fn is_stale_by_time(&self, stale_time: StaleTime) -> bool;
    /// Effective gc time.
    fn gc_time(&self) -> GcTime;
    /// Metadata from the options.
    fn meta(&self) -> Option<Meta>;
    /// Marks the query stale.
    fn invalidate(&self);
    /// Cancels the fetch in flight. Resolves once the fetch settled.
    fn cancel(&self, options: CancelOptions) -> LocalBoxFuture<'static, ()>;
    /// Fetches with the current options.
    fn refetch(&self, fetch_options: FetchOptions) -> LocalBoxFuture<'static, Result<(), QueryError>>;
    /// Restores the initial state.
    fn reset(&self);
    /// Window focus regained.
    fn on_focus(&self);
    /// Connectivity regained.
    fn on_online(&self);
    /// Serializable snapshot.
    fn dehydrate(&self) -> Result<DehydratedQuery, QueryError>;
    /// Replaces the state from a snapshot. With `only_if_newer`, older snapshots are ignored.
    fn hydrate(&self, state: &DehydratedQueryState, only_if_newer: bool) -> Result<(), QueryError>;
    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    #[doc(hidden)]
    fn destroy(&self);
}

impl std::fmt::Debug for dyn AnyQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("query_hash", &self.query_hash())
            .field("status", &self.status())
            .field("fetch_status", &self.fetch_status())
            .finish()
    }
}

/// One cache slot: the state machine for a single key.
pub struct Query<V> {
    inner: Rc<QueryInner<V>>,
}

impl<V> Clone for Query<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct QueryInner<V> {
    id: QueryId,
    key: QueryKey,
    hash: String,
    state: RefCell<QueryState<V>>,
    initial_state: QueryState<V>,
    revert_state: RefCell<Option<QueryState<V>>>,
    options: RefCell<DefaultedQueryOptions<V>>,
    observers: RefCell<Vec<(ObserverKey, Weak<dyn QueryListener>)>>,
    retryer: RefCell<Option<Retryer<V>>>,
    promise: RefCell<Option<QueryPromise<V>>>,
    fetch_id: Cell<u64>,
    gc: GarbageCollector,
    cache: WeakQueryCache,
    env: Environment,
}

impl<V> std::fmt::Debug for Query<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl<V: QueryValue> Query<V> {
    pub(crate) fn new(
        options: DefaultedQueryOptions<V>,
        cache: WeakQueryCache,
        env: Environment,
    ) -> Self {
        let initial_state =
            QueryState::new(options.initial_data.clone(), options.initial_data_updated_at);
        let query = Query {
            inner: Rc::new(QueryInner {
                id: QueryId(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed)),
                key: options.query_key.clone(),
                hash: options.query_hash.clone(),
                state: RefCell::new(initial_state.clone()),
                initial_state,
                revert_state: RefCell::new(None),
                gc: GarbageCollector::new(options.config.gc_time),
                options: RefCell::new(options),
                observers: RefCell::new(Vec::new()),
                retryer: RefCell::new(None),
                promise: RefCell::new(None),
                fetch_id: Cell::new(0),
                cache,
                env,
            }),
        };
        query.schedule_gc();
        query
    }

    fn from_weak(weak: &Weak<QueryInner<V>>) -> Option<Self> {
        weak.upgrade().map(|inner| Query { inner })
    }

    /// The query for `weak`, if it is alive and `fetch_id` is still its current fetch.
    fn current(weak: &Weak<QueryInner<V>>, fetch_id: u64) -> Option<Self> {
        Self::from_weak(weak).filter(|query| query.inner.fetch_id.get() == fetch_id)
    }

    pub(crate) fn erased(&self) -> Rc<dyn AnyQuery> {
        Rc::new(self.clone())
    }

    /// Whether both handles point to the same query instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Key the query was built with.
    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// Canonical hash.
    pub fn hash(&self) -> &str {
        &self.inner.hash
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState<V> {
        self.inner.state.borrow().clone()
    }

    /// Reads the current state without cloning it.
    pub fn with_state<R>(&self, func: impl FnOnce(&QueryState<V>) -> R) -> R {
        func(&self.inner.state.borrow())
    }

    /// Cached data.
    pub fn data(&self) -> Option<V> {
        self.inner.state.borrow().data.clone()
    }

    /// Effective options.
    pub fn options(&self) -> DefaultedQueryOptions<V> {
        self.inner.options.borrow().clone()
    }

    pub(crate) fn set_options(&self, options: DefaultedQueryOptions<V>) {
        self.inner.gc.update_gc_time(options.config.gc_time);
        *self.inner.options.borrow_mut() = options;
    }

    /// Writes data directly, applying structural sharing. Returns the stored value.
    pub fn set_data(&self, data: V, updated_at: Option<Instant>, manual: bool) -> V {
        let data = {
            let state = self.inner.state.borrow();
            let options = self.inner.options.borrow();
            options
                .structural_sharing
                .replace_data(state.data.as_ref(), data)
        };
        self.dispatch(Action::Success {
            data: data.clone(),
            updated_at,
            manual,
        });
        data
    }

    /// Replaces the whole state.
    pub fn set_state(&self, state: QueryState<V>) {
        self.dispatch(Action::SetState(state));
    }

    fn listeners(&self) -> Vec<Rc<dyn QueryListener>> {
        self.inner
            .observers
            .borrow()
            .iter()
            .filter_map(|(_, observer)| observer.upgrade())
            .collect()
    }

    fn apply(&self, action: Action<V>) -> ActionKind {
        let kind = action.kind();
        let next = {
            let state = self.inner.state.borrow();
            let revert_state = self.inner.revert_state.borrow();
            state.reduce(action, revert_state.as_ref())
        };
        *self.inner.state.borrow_mut() = next;
        tracing::trace!(query_hash = %self.inner.hash, action = ?kind, "query state updated");
        kind
    }

    fn dispatch(&self, action: Action<V>) {
        let kind = self.apply(action);
        self.inner.env.notify.batch(|| {
            for observer in self.listeners() {
                observer.on_query_update();
            }
            if let Some(cache) = self.inner.cache.upgrade() {
                cache.notify(QueryCacheEvent::Updated {
                    query: self.erased(),
                    action: kind,
                });
            }
        });
    }

    /// Starts a fetch, or joins the one in flight.
    pub(crate) fn fetch(
        &self,
        options: Option<DefaultedQueryOptions<V>>,
        fetch_options: FetchOptions,
    ) -> QueryPromise<V> {
        let (fetch_status, has_data) =
            self.with_state(|state| (state.fetch_status, state.data.is_some()));
        if fetch_status != FetchStatus::Idle {
            if has_data && fetch_options.cancel_refetch {
                drop(self.cancel(CancelOptions {
                    revert: false,
                    silent: true,
                }));
            } else if let Some(promise) = self.inner.promise.borrow().clone() {
                if let Some(retryer) = self.inner.retryer.borrow().as_ref() {
                    retryer.continue_retry();
                }
                return promise;
            }
        }

        if let Some(options) = options {
            self.set_options(options);
        }
        let options = self.options();
        let signal = CancelSignal::default();
        let run = self.fetch_fn(&options, fetch_options.meta, signal.clone());

        *self.inner.revert_state.borrow_mut() = Some(self.state());
        let meta_changed = self.with_state(|state| state.fetch_meta != fetch_options.meta);
        if fetch_status == FetchStatus::Idle || meta_changed {
            self.dispatch(Action::Fetch {
                meta: fetch_options.meta,
                can_fetch: can_fetch(options.config.network_mode, &self.inner.env),
            });
        }

        let fetch_id = self.inner.fetch_id.get() + 1;
        self.inner.fetch_id.set(fetch_id);
        let weak = Rc::downgrade(&self.inner);

        let on_fail = {
            let weak = weak.clone();
            Rc::new(move |failure_count: u32, error: &FetchError| {
                if let Some(query) = Self::current(&weak, fetch_id) {
                    query.dispatch(Action::Failed {
                        failure_count,
                        error: error.clone(),
                    });
                }
            })
        };
        let on_pause = {
            let weak = weak.clone();
            Rc::new(move || {
                if let Some(query) = Self::current(&weak, fetch_id) {
                    query.dispatch(Action::Pause);
                }
            })
        };
        let on_continue = {
            let weak = weak.clone();
            Rc::new(move || {
                if let Some(query) = Self::current(&weak, fetch_id) {
                    query.dispatch(Action::Continue);
                }
            })
        };

        let retryer = Retryer::new(RetryerConfig {
            run,
            retry: options.config.retry.clone(),
            retry_delay: options.config.retry_delay.clone(),
            network_mode: options.config.network_mode,
            env: self.inner.env.clone(),
            signal,
            can_run: Rc::new(|| true),
            on_fail,
            on_pause,
            on_continue,
        });

        let promise = retryer
            .promise()
            .map(move |result| match Self::current(&weak, fetch_id) {
                Some(query) => query.settle(result),
                // Superseded fetches never touch the state.
                None => result,
            })
            .boxed_local()
            .shared();

        *self.inner.retryer.borrow_mut() = Some(retryer);
        *self.inner.promise.borrow_mut() = Some(promise.clone());
        tracing::debug!(query_hash = %self.inner.hash, "fetch started");
        spawn_local(promise.clone().map(drop));
        promise
    }

    fn fetch_fn(
        &self,
        options: &DefaultedQueryOptions<V>,
        fetch_meta: Option<FetchMeta>,
        signal: CancelSignal,
    ) -> Rc<dyn Fn() -> LocalBoxFuture<'static, Result<V, FetchError>>> {
        if let Some(behavior) = options.behavior.clone() {
            let context = FetchContext {
                query_key: self.inner.key.clone(),
                state: self.state(),
                fetch_meta,
                signal,
                meta: options.config.meta.clone(),
            };
            return Rc::new(move || behavior.on_fetch(context.clone()));
        }

        let context = QueryFunctionContext {
            query_key: self.inner.key.clone(),
            signal,
            meta: options.config.meta.clone(),
        };
        match options.query_fn.clone() {
            Some(query_fn) => Rc::new(move || query_fn(context.clone())),
            None => {
                let query_hash = self.inner.hash.clone();
                tracing::warn!(%query_hash, "fetch requested without a query function");
                Rc::new(move || {
                    let error = QueryError::MissingQueryFn {
                        query_hash: query_hash.clone(),
                    };
                    future::ready(Err(FetchError::from(error))).boxed_local()
                })
            }
        }
    }

    fn settle(&self, result: Result<V, QueryError>) -> Result<V, QueryError> {
        let cache = self.inner.cache.upgrade();
        let result = match result {
            Ok(data) => {
                let data = self.set_data(data, None, false);
                if let Some(cache) = &cache {
                    cache.on_success(self);
                }
                Ok(data)
            }
            Err(QueryError::Cancelled(cancelled)) => {
                tracing::debug!(query_hash = %self.inner.hash, ?cancelled, "fetch cancelled");
                let action = Action::Cancelled {
                    revert: cancelled.revert,
                };
                // A silent cancel still goes idle, it only skips notifications.
                if cancelled.silent {
                    self.apply(action);
                } else {
                    self.dispatch(action);
                }
                Err(QueryError::Cancelled(cancelled))
            }
            Err(error) => {
                let fetch_error = error
                    .fetch_error()
                    .cloned()
                    .unwrap_or_else(|| FetchError::msg(&error));
                tracing::debug!(query_hash = %self.inner.hash, error = %fetch_error, "fetch failed");
                self.dispatch(Action::Error {
                    error: fetch_error.clone(),
                });
                if let Some(cache) = &cache {
                    cache.on_error(&fetch_error, self);
                }
                Err(error)
            }
        };
        self.schedule_gc();
        result
    }

    /// Cancels the fetch in flight. The returned future resolves once it settled.
    pub fn cancel(&self, options: CancelOptions) -> LocalBoxFuture<'static, ()> {
        let promise = self.inner.promise.borrow().clone();
        if let Some(retryer) = self.inner.retryer.borrow().as_ref() {
            retryer.cancel(options);
        }
        match promise {
            Some(promise) => promise.map(drop).boxed_local(),
            None => future::ready(()).boxed_local(),
        }
    }

    pub(crate) fn continue_fetch(&self) {
        if let Some(retryer) = self.inner.retryer.borrow().as_ref() {
            retryer.continue_fetch();
        }
    }

    /// Marks the data stale.
    pub fn invalidate(&self) {
        if !self.with_state(|state| state.is_invalidated) {
            self.dispatch(Action::Invalidate);
        }
    }

    /// Whether the data is older than `stale_time` or invalidated.
    pub fn is_stale_by_time(&self, stale_time: StaleTime) -> bool {
        self.with_state(|state| state.is_stale_by_time(stale_time))
    }

    pub(crate) fn add_observer(&self, key: ObserverKey, observer: Weak<dyn QueryListener>) {
        {
            let mut observers = self.inner.observers.borrow_mut();
            if observers.iter().any(|(existing, _)| *existing == key) {
                return;
            }
            observers.push((key, observer));
        }
        self.inner.gc.disable_gc();
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.notify(QueryCacheEvent::ObserverAdded(self.erased()));
        }
    }

    pub(crate) fn remove_observer(&self, key: ObserverKey) {
        let now_empty = {
            let mut observers = self.inner.observers.borrow_mut();
            let before = observers.len();
            observers.retain(|(existing, _)| *existing != key);
            if observers.len() == before {
                return;
            }
            observers.is_empty()
        };
        if now_empty {
            if let Some(retryer) = self.inner.retryer.borrow().as_ref() {
                retryer.cancel_retry();
            }
            self.schedule_gc();
        }
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.notify(QueryCacheEvent::ObserverRemoved(self.erased()));
        }
    }

    pub(crate) fn schedule_gc(&self) {
        let weak = Rc::downgrade(&self.inner);
        self.inner.gc.enable_gc(move || {
            if let Some(query) = Self::from_weak(&weak) {
                query.optional_remove();
            }
        });
    }

    fn optional_remove(&self) {
        let idle = self.with_state(|state| state.fetch_status == FetchStatus::Idle);
        if self.inner.observers.borrow().is_empty() && idle {
            if let Some(cache) = self.inner.cache.upgrade() {
                tracing::debug!(query_hash = %self.inner.hash, "garbage collecting query");
                cache.remove(self);
            }
        }
    }

    pub(crate) fn notify_cache(&self, event: impl FnOnce(Rc<dyn AnyQuery>) -> QueryCacheEvent) {
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.notify(event(self.erased()));
        }
    }
}

impl<V: QueryValue> AnyQuery for Query<V> {
    fn id(&self) -> QueryId {
        self.inner.id
    }

    fn query_hash(&self) -> &str {
        &self.inner.hash
    }

    fn query_key(&self) -> &QueryKey {
        &self.inner.key
    }

    fn status(&self) -> QueryStatus {
        self.with_state(|state| state.status)
    }

    fn fetch_status(&self) -> FetchStatus {
        self.with_state(|state| state.fetch_status)
    }

    fn data_updated_at(&self) -> Option<Instant> {
        self.with_state(|state| state.data_updated_at)
    }

    fn has_data(&self) -> bool {
        self.with_state(|state| state.data.is_some())
    }

    fn error(&self) -> Option<FetchError> {
        self.with_state(|state| state.error.clone())
    }

    fn fetch_failure_count(&self) -> u32 {
        self.with_state(|state| state.fetch_failure_count)
    }

    fn is_invalidated(&self) -> bool {
        self.with_state(|state| state.is_invalidated)
    }

    fn observer_count(&self) -> usize {
        self.listeners().len()
    }

    fn is_active(&self) -> bool {
        self.listeners().iter().any(|observer| observer.is_enabled())
    }

    fn is_disabled(&self) -> bool {
        if self.observer_count() > 0 {
            return !self.is_active();
        }
        self.with_state(|state| state.data_update_count + state.error_update_count == 0)
    }

    fn is_static(&self) -> bool {
        self.inner.options.borrow().config.stale_time == StaleTime::Static
    }

    fn is_stale(&self) -> bool {
        let listeners = self.listeners();
        if !listeners.is_empty() {
            return listeners.iter().any(|observer| observer.is_stale());
        }
        self.with_state(|state| state.data.is_none() || state.is_invalidated)
    }

    fn is_stale_by_time(&self, stale_time: StaleTime) -> bool {
        Query::is_stale_by_time(self, stale_time)
    }

    fn gc_time(&self) -> GcTime {
        self.inner.gc.gc_time()
    }

    fn meta(&self) -> Option<Meta> {
        self.inner.options.borrow().config.meta.clone()
    }

    fn invalidate(&self) {
        Query::invalidate(self)
    }

    fn cancel(&self, options: CancelOptions) -> LocalBoxFuture<'static, ()> {
        Query::cancel(self, options)
    }

    fn refetch(&self, fetch_options: FetchOptions) -> LocalBoxFuture<'static, Result<(), QueryError>> {
        self.fetch(None, fetch_options)
            .map(|result| result.map(drop))
            .boxed_local()
    }

    fn reset(&self) {
        self.destroy();
        self.set_state(self.inner.initial_state.clone());
    }

    fn on_focus(&self) {
        if let Some(observer) = self
            .listeners()
            .into_iter()
            .find(|observer| observer.should_fetch_on_window_focus())
        {
            observer.refetch_in_background();
        }
        self.continue_fetch();
    }

    fn on_online(&self) {
        if let Some(observer) = self
            .listeners()
            .into_iter()
            .find(|observer| observer.should_fetch_on_reconnect())
        {
            observer.refetch_in_background();
        }
        self.continue_fetch();
    }

    fn dehydrate(&self) -> Result<DehydratedQuery, QueryError> {
        Ok(DehydratedQuery {
            query_hash: self.inner.hash.clone(),
            query_key: self.inner.key.clone(),
            state: self.with_state(DehydratedQueryState::from_state)?,
            meta: self.meta(),
        })
    }

    fn hydrate(&self, state: &DehydratedQueryState, only_if_newer: bool) -> Result<(), QueryError> {
        let current = self.data_updated_at();
        if only_if_newer && current.is_some() && state.data_updated_at <= current {
            return Ok(());
        }
        let mut state = state.to_state::<V>()?;
        // The local fetch status is kept, only data and errors travel.
        state.fetch_status = self.fetch_status();
        self.set_state(state);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn destroy(&self) {
        self.inner.gc.disable_gc();
        drop(Query::cancel(
            self,
            CancelOptions {
                revert: false,
                silent: true,
            },
        ));
    }
}
