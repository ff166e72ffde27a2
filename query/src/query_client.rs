use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use futures::{
    future::{self, LocalBoxFuture},
    FutureExt,
};

use crate::{
    environment::{Environment, SignalKey},
    filters::{MutationFilters, QueryFilters, QueryTypeFilter},
    hash_key,
    mutation::{Mutation, MutationContext, MutationStatus, MutationValue},
    mutation_cache::{MutationCache, MutationCacheConfig},
    mutation_options::{DefaultMutationOptions, MutationOptions, MutationOverrides},
    partial_match_key,
    query::{FetchOptions, Query},
    query_cache::{QueryCache, QueryCacheConfig},
    query_options::{DefaultQueryOptions, DefaultedQueryOptions, QueryOptions, QueryOverrides, Retry},
    query_state::{FetchStatus, QueryState},
    retryer::CancelOptions,
    util::spawn_local,
    QueryError, QueryKey, QueryValue,
};

/// Everything a [`QueryClient`] is configured with.
#[derive(Clone, Default)]
pub struct QueryClientConfig {
    /// Callbacks of the query cache.
    pub query_cache: QueryCacheConfig,
    /// Callbacks of the mutation cache.
    pub mutation_cache: MutationCacheConfig,
    /// Client-wide query defaults.
    pub default_options: DefaultQueryOptions,
    /// Client-wide mutation defaults.
    pub default_mutation_options: DefaultMutationOptions,
}

/// Which queries [`QueryClient::invalidate_queries`] refetches after marking them stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefetchType {
    /// Queries with enabled observers.
    #[default]
    Active,
    /// Queries without enabled observers.
    Inactive,
    /// Every matching query.
    All,
    /// Only mark them stale.
    None,
}

/// Options of [`QueryClient::invalidate_queries`].
#[derive(Debug, Clone, Copy)]
pub struct InvalidateOptions {
    /// Which invalidated queries are refetched.
    pub refetch_type: RefetchType,
    /// Cancel fetches in flight instead of joining them.
    pub cancel_refetch: bool,
}

impl Default for InvalidateOptions {
    fn default() -> Self {
        Self {
            refetch_type: RefetchType::Active,
            cancel_refetch: true,
        }
    }
}

/// The entry point: owns the caches, merges defaults and runs bulk operations.
///
/// Cloning is cheap and every clone shares the same caches.
#[derive(Clone)]
pub struct QueryClient {
    inner: Rc<ClientInner>,
}

struct ClientInner {
    env: Environment,
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    default_options: RefCell<DefaultQueryOptions>,
    default_mutation_options: RefCell<DefaultMutationOptions>,
    query_defaults: RefCell<Vec<(QueryKey, QueryOverrides)>>,
    mutation_defaults: RefCell<Vec<(QueryKey, MutationOverrides)>>,
    mount_count: Cell<usize>,
    signal_keys: RefCell<Option<(SignalKey, SignalKey)>>,
}

/// Non-owning handle to a [`QueryClient`], held by cache subscribers.
#[derive(Clone)]
pub(crate) struct WeakQueryClient(Weak<ClientInner>);

impl WeakQueryClient {
    pub(crate) fn upgrade(&self) -> Option<QueryClient> {
        self.0.upgrade().map(|inner| QueryClient { inner })
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(QueryClientConfig::default())
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("query_cache", &self.inner.query_cache)
            .field("mutation_cache", &self.inner.mutation_cache)
            .finish()
    }
}

impl QueryClient {
    /// Creates a client with its own caches and environment signals.
    pub fn new(config: QueryClientConfig) -> Self {
        let env = Environment::default();
        Self {
            inner: Rc::new(ClientInner {
                query_cache: QueryCache::new(config.query_cache, env.clone()),
                mutation_cache: MutationCache::new(config.mutation_cache, env.clone()),
                env,
                default_options: RefCell::new(config.default_options),
                default_mutation_options: RefCell::new(config.default_mutation_options),
                query_defaults: RefCell::new(Vec::new()),
                mutation_defaults: RefCell::new(Vec::new()),
                mount_count: Cell::new(0),
                signal_keys: RefCell::new(None),
            }),
        }
    }

    /// Starts reacting to focus and connectivity changes. Calls nest.
    pub fn mount(&self) {
        let count = self.inner.mount_count.get() + 1;
        self.inner.mount_count.set(count);
        if count > 1 {
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        let focus_key = self.inner.env.focus.subscribe({
            let weak = weak.clone();
            move |focused| {
                if focused {
                    on_environment_change(&weak, QueryCache::on_focus);
                }
            }
        });
        let online_key = self.inner.env.online.subscribe(move |online| {
            if online {
                on_environment_change(&weak, QueryCache::on_online);
            }
        });
        *self.inner.signal_keys.borrow_mut() = Some((focus_key, online_key));
        tracing::debug!("query client mounted");
    }

    /// Undoes one [`mount`](Self::mount).
    pub fn unmount(&self) {
        let count = self.inner.mount_count.get().saturating_sub(1);
        self.inner.mount_count.set(count);
        if count > 0 {
            return;
        }
        if let Some((focus_key, online_key)) = self.inner.signal_keys.borrow_mut().take() {
            self.inner.env.focus.unsubscribe(focus_key);
            self.inner.env.online.unsubscribe(online_key);
            tracing::debug!("query client unmounted");
        }
    }

    pub(crate) fn downgrade(&self) -> WeakQueryClient {
        WeakQueryClient(Rc::downgrade(&self.inner))
    }

    /// The query cache.
    pub fn query_cache(&self) -> &QueryCache {
        &self.inner.query_cache
    }

    /// The mutation cache.
    pub fn mutation_cache(&self) -> &MutationCache {
        &self.inner.mutation_cache
    }

    /// Focus, connectivity and notification batching of this client.
    pub fn environment(&self) -> &Environment {
        &self.inner.env
    }

    /// The client-wide query defaults.
    pub fn get_default_options(&self) -> DefaultQueryOptions {
        self.inner.default_options.borrow().clone()
    }

    /// Replaces the client-wide query defaults.
    pub fn set_default_options(&self, options: DefaultQueryOptions) {
        *self.inner.default_options.borrow_mut() = options;
    }

    /// Sets defaults for every query whose key starts with `query_key`.
    pub fn set_query_defaults(&self, query_key: impl Into<QueryKey>, overrides: QueryOverrides) {
        let query_key = query_key.into();
        let hash = hash_key(&query_key);
        let mut defaults = self.inner.query_defaults.borrow_mut();
        match defaults.iter_mut().find(|(key, _)| hash_key(key) == hash) {
            Some(entry) => entry.1 = overrides,
            None => defaults.push((query_key, overrides)),
        }
    }

    /// The client defaults with every matching per-key default applied.
    pub fn get_query_defaults(&self, query_key: &QueryKey) -> DefaultQueryOptions {
        let mut options = self.get_default_options();
        for (prefix, overrides) in self.inner.query_defaults.borrow().iter() {
            if partial_match_key(query_key, prefix) {
                overrides.apply_to(&mut options);
            }
        }
        options
    }

    /// Sets defaults for every mutation whose key starts with `mutation_key`.
    pub fn set_mutation_defaults(&self, mutation_key: impl Into<QueryKey>, overrides: MutationOverrides) {
        let mutation_key = mutation_key.into();
        let hash = hash_key(&mutation_key);
        let mut defaults = self.inner.mutation_defaults.borrow_mut();
        match defaults.iter_mut().find(|(key, _)| hash_key(key) == hash) {
            Some(entry) => entry.1 = overrides,
            None => defaults.push((mutation_key, overrides)),
        }
    }

    /// The client mutation defaults with every matching per-key default applied.
    pub fn get_mutation_defaults(&self, mutation_key: Option<&QueryKey>) -> DefaultMutationOptions {
        let mut options = self.inner.default_mutation_options.borrow().clone();
        if let Some(mutation_key) = mutation_key {
            for (prefix, overrides) in self.inner.mutation_defaults.borrow().iter() {
                if partial_match_key(mutation_key, prefix) {
                    overrides.apply_to(&mut options);
                }
            }
        }
        options
    }

    /// Merges `options` over the per-key and client defaults.
    pub fn default_query_options<V>(&self, options: QueryOptions<V>) -> DefaultedQueryOptions<V> {
        let defaults = self.get_query_defaults(&options.query_key);
        DefaultedQueryOptions::resolve(options, defaults)
    }

    fn retry_is_configured(&self, options: &QueryOptions<impl Sized>) -> bool {
        options.overrides.retry.is_some()
            || self
                .inner
                .query_defaults
                .borrow()
                .iter()
                .any(|(prefix, overrides)| {
                    overrides.retry.is_some() && partial_match_key(&options.query_key, prefix)
                })
    }

    /// Builds a mutation with the merged defaults and registers it.
    pub fn build_mutation<D, Vars, Ctx>(&self, options: MutationOptions<D, Vars, Ctx>) -> Mutation<D, Vars, Ctx>
    where
        D: MutationValue,
        Vars: MutationValue,
        Ctx: MutationContext,
    {
        let mut config = self.get_mutation_defaults(options.mutation_key.as_ref());
        options.overrides.apply_to(&mut config);
        self.inner.mutation_cache.build(options, config)
    }

    /// Returns cached data when it is fresh, otherwise fetches it.
    ///
    /// Imperative fetches do not retry unless a retry policy is set explicitly.
    pub async fn fetch_query<V: QueryValue>(&self, options: QueryOptions<V>) -> Result<V, QueryError> {
        let retry_configured = self.retry_is_configured(&options);
        let mut defaulted = self.default_query_options(options);
        if !retry_configured {
            defaulted.config.retry = Retry::Never;
        }
        let query = self.inner.query_cache.build(defaulted.clone())?;
        let stale = query.is_stale_by_time(defaulted.config.stale_time);
        match query.data() {
            Some(data) if !stale => Ok(data),
            _ => query.fetch(Some(defaulted), FetchOptions::default()).await,
        }
    }

    /// Like [`fetch_query`](Self::fetch_query), but only warms the cache.
    ///
    /// Errors are logged and swallowed unless `throw_on_error` is set.
    pub async fn prefetch_query<V: QueryValue>(
        &self,
        options: QueryOptions<V>,
        throw_on_error: bool,
    ) -> Result<(), QueryError> {
        let query_hash = self.default_query_options(options.clone()).query_hash;
        match self.fetch_query(options).await {
            Ok(_) => Ok(()),
            Err(error) if throw_on_error => Err(error),
            Err(error) => {
                tracing::debug!(%query_hash, %error, "prefetch failed");
                Ok(())
            }
        }
    }

    /// Returns cached data when it is fresh, otherwise fetches it.
    ///
    /// With `revalidate_if_stale`, stale cached data is returned right away and refetched
    /// in the background instead.
    pub async fn ensure_query_data<V: QueryValue>(
        &self,
        options: QueryOptions<V>,
        revalidate_if_stale: bool,
    ) -> Result<V, QueryError> {
        let defaulted = self.default_query_options(options.clone());
        let Some(query) = self.inner.query_cache.get_query::<V>(&defaulted.query_hash)? else {
            return self.fetch_query(options).await;
        };
        let Some(data) = query.data() else {
            return self.fetch_query(options).await;
        };
        if !query.is_stale_by_time(defaulted.config.stale_time) {
            return Ok(data);
        }
        if !revalidate_if_stale {
            return self.fetch_query(options).await;
        }
        let client = self.clone();
        spawn_local(async move {
            let _ = client.prefetch_query(options, false).await;
        });
        Ok(data)
    }

    fn typed_query<V: QueryValue>(&self, query_key: &QueryKey) -> Option<Query<V>> {
        let query_hash = hash_key(query_key);
        match self.inner.query_cache.get_query::<V>(&query_hash) {
            Ok(query) => query,
            Err(error) => {
                tracing::warn!(%query_hash, %error, "cached query has another value type");
                None
            }
        }
    }

    /// Cached data for `query_key`. `None` when missing or cached with another type.
    pub fn get_query_data<V: QueryValue>(&self, query_key: &QueryKey) -> Option<V> {
        self.typed_query::<V>(query_key).and_then(|query| query.data())
    }

    /// Full state of the query for `query_key`.
    pub fn get_query_state<V: QueryValue>(&self, query_key: &QueryKey) -> Option<QueryState<V>> {
        self.typed_query::<V>(query_key).map(|query| query.state())
    }

    /// Writes data directly, creating the query if needed. Returns the stored value.
    pub fn set_query_data<V: QueryValue>(&self, query_key: impl Into<QueryKey>, data: V) -> Result<V, QueryError> {
        let options = self.default_query_options(QueryOptions::new(query_key));
        let query = self.inner.query_cache.build(options)?;
        Ok(query.set_data(data, None, true))
    }

    /// Computes new data from the cached one. Returning `None` leaves the cache untouched
    /// and does not create the query.
    pub fn update_query_data<V: QueryValue>(
        &self,
        query_key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<&V>) -> Option<V>,
    ) -> Result<Option<V>, QueryError> {
        let options = self.default_query_options(QueryOptions::new(query_key));
        let existing = self.inner.query_cache.get_query::<V>(&options.query_hash)?;
        let current = existing.as_ref().and_then(Query::data);
        let Some(next) = updater(current.as_ref()) else {
            return Ok(None);
        };
        let query = match existing {
            Some(query) => query,
            None => self.inner.query_cache.build(options)?,
        };
        Ok(Some(query.set_data(next, None, true)))
    }

    /// Data of every matching query cached with value type `V`.
    pub fn get_queries_data<V: QueryValue>(&self, filters: &QueryFilters) -> Vec<(QueryKey, Option<V>)> {
        self.inner
            .query_cache
            .find_all(filters)
            .into_iter()
            .filter_map(|query| {
                let typed = query.as_any().downcast_ref::<Query<V>>()?;
                Some((typed.key().clone(), typed.data()))
            })
            .collect()
    }

    /// Applies `updater` to every matching query cached with value type `V`.
    pub fn set_queries_data<V: QueryValue>(
        &self,
        filters: &QueryFilters,
        updater: impl Fn(Option<&V>) -> Option<V>,
    ) -> Vec<(QueryKey, Option<V>)> {
        self.inner.env.notify.batch(|| {
            self.inner
                .query_cache
                .find_all(filters)
                .into_iter()
                .filter_map(|query| {
                    let typed = query.as_any().downcast_ref::<Query<V>>()?.clone();
                    let next = updater(typed.data().as_ref())
                        .map(|data| typed.set_data(data, None, true));
                    Some((typed.key().clone(), next))
                })
                .collect()
        })
    }

    /// Marks matching queries stale, then refetches them per `options.refetch_type`.
    ///
    /// Invalidation and the start of the refetches happen before this returns; the
    /// future resolves once the refetches settled.
    pub fn invalidate_queries(
        &self,
        filters: QueryFilters,
        options: InvalidateOptions,
    ) -> LocalBoxFuture<'static, ()> {
        self.inner.env.notify.batch(|| {
            for query in self.inner.query_cache.find_all(&filters) {
                query.invalidate();
            }
        });
        let kind = match options.refetch_type {
            RefetchType::None => return future::ready(()).boxed_local(),
            RefetchType::Active => QueryTypeFilter::Active,
            RefetchType::Inactive => QueryTypeFilter::Inactive,
            RefetchType::All => QueryTypeFilter::All,
        };
        self.refetch_queries(filters.set_kind(kind), options.cancel_refetch)
    }

    /// Refetches matching queries that are enabled and not static. Errors are logged.
    pub fn refetch_queries(&self, filters: QueryFilters, cancel_refetch: bool) -> LocalBoxFuture<'static, ()> {
        let fetches = self.inner.env.notify.batch(|| {
            self.inner
                .query_cache
                .find_all(&filters)
                .into_iter()
                .filter(|query| !query.is_disabled() && !query.is_static())
                .map(|query| {
                    let query_hash = query.query_hash().to_string();
                    query
                        .refetch(FetchOptions {
                            cancel_refetch,
                            meta: None,
                        })
                        .map(move |result| {
                            if let Err(error) = result {
                                if !error.is_cancelled() {
                                    tracing::debug!(%query_hash, %error, "refetch failed");
                                }
                            }
                        })
                })
                .collect::<Vec<_>>()
        });
        future::join_all(fetches).map(drop).boxed_local()
    }

    /// Removes matching queries from the cache.
    pub fn remove_queries(&self, filters: &QueryFilters) {
        self.inner.env.notify.batch(|| {
            for query in self.inner.query_cache.find_all(filters) {
                self.inner.query_cache.remove(query.as_ref());
            }
        });
    }

    /// Restores matching queries to their initial state and refetches the active ones.
    pub fn reset_queries(&self, filters: QueryFilters) -> LocalBoxFuture<'static, ()> {
        self.inner.env.notify.batch(|| {
            for query in self.inner.query_cache.find_all(&filters) {
                query.reset();
            }
        });
        self.refetch_queries(filters.set_kind(QueryTypeFilter::Active), true)
    }

    /// Cancels the fetches of matching queries. Resolves once they settled.
    pub fn cancel_queries(&self, filters: &QueryFilters, options: CancelOptions) -> LocalBoxFuture<'static, ()> {
        let cancels = self.inner.env.notify.batch(|| {
            self.inner
                .query_cache
                .find_all(filters)
                .into_iter()
                .map(|query| query.cancel(options))
                .collect::<Vec<_>>()
        });
        future::join_all(cancels).map(drop).boxed_local()
    }

    /// Number of matching queries currently fetching.
    pub fn is_fetching(&self, filters: &QueryFilters) -> usize {
        self.inner
            .query_cache
            .find_all(filters)
            .iter()
            .filter(|query| query.fetch_status() == FetchStatus::Fetching)
            .count()
    }

    /// Number of matching mutations currently pending.
    pub fn is_mutating(&self, filters: &MutationFilters) -> usize {
        self.inner
            .mutation_cache
            .find_all(filters)
            .iter()
            .filter(|mutation| mutation.status() == MutationStatus::Pending)
            .count()
    }

    /// Resumes paused mutations when online.
    pub async fn resume_paused_mutations(&self) {
        if self.inner.env.online.is_online() {
            self.inner.mutation_cache.resume_paused_mutations().await;
        }
    }

    /// Empties both caches.
    pub fn clear(&self) {
        self.inner.query_cache.clear();
        self.inner.mutation_cache.clear();
    }
}

fn on_environment_change(weak: &Weak<ClientInner>, notify_queries: fn(&QueryCache)) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let client = QueryClient { inner };
    spawn_local(async move {
        client.resume_paused_mutations().await;
        notify_queries(client.query_cache());
    });
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, time::Duration};

    use super::*;
    use crate::{
        query_options::{GcTime, RetryDelay, StaleTime},
        query_state::QueryStatus,
        test_util::run_local,
        FetchError,
    };

    fn counting_options(key: &str, calls: Rc<Cell<u32>>) -> QueryOptions<u32> {
        QueryOptions::new(key).set_query_fn(move |_| {
            let calls = calls.clone();
            async move {
                calls.set(calls.get() + 1);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(calls.get())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn update_query_data() {
        run_local(async {
            let client = QueryClient::default();
            let key = QueryKey::from("monkey");

            assert_eq!(client.get_query_data::<String>(&key), None);
            assert_eq!(client.update_query_data::<String>("monkey", |_| None).unwrap(), None);
            assert!(client.query_cache().get_all().is_empty());

            client
                .update_query_data::<String>("monkey", |_| Some("George".to_string()))
                .unwrap();
            assert_eq!(client.get_query_data::<String>(&key), Some("George".to_string()));

            client
                .update_query_data::<String>("monkey", |current| {
                    assert_eq!(current.map(String::as_str), Some("George"));
                    Some("Luffy".to_string())
                })
                .unwrap();
            assert_eq!(client.get_query_data::<String>(&key), Some("Luffy".to_string()));
            assert_eq!(
                client.get_query_state::<String>(&key).map(|state| state.status),
                Some(QueryStatus::Success)
            );
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn set_query_data_rejects_other_value_type() {
        run_local(async {
            let client = QueryClient::default();
            client.set_query_data("answer", 42_u32).unwrap();
            let error = client.set_query_data("answer", "42".to_string()).unwrap_err();
            assert!(matches!(error, QueryError::TypeMismatch { .. }));
            assert_eq!(client.get_query_data::<String>(&QueryKey::from("answer")), None);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_are_deduplicated() {
        run_local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            let (a, b) = futures::join!(
                client.fetch_query(counting_options("dedup", calls.clone())),
                client.fetch_query(counting_options("dedup", calls.clone())),
            );
            assert_eq!((a.unwrap(), b.unwrap()), (1, 1));
            assert_eq!(calls.get(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_query_returns_fresh_data_without_fetching() {
        run_local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            let options = || counting_options("fresh", calls.clone()).set_stale_time(Duration::from_secs(10));
            assert_eq!(client.fetch_query(options()).await.unwrap(), 1);
            assert_eq!(client.fetch_query(options()).await.unwrap(), 1);
            assert_eq!(calls.get(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_query_does_not_retry_by_default() {
        run_local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            let counter = calls.clone();
            let options = QueryOptions::<u32>::new("failing").set_query_fn(move |_| {
                counter.set(counter.get() + 1);
                async { Err(FetchError::msg("nope")) }
            });
            assert!(client.fetch_query(options.clone()).await.is_err());
            assert_eq!(calls.get(), 1);

            let retried = options
                .set_retry(Retry::Count(2))
                .set_retry_delay(RetryDelay::Fixed(Duration::from_millis(1)));
            assert!(client.fetch_query(retried).await.is_err());
            assert_eq!(calls.get(), 4);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_query_data_uses_fresh_cache() {
        run_local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            client.set_query_data("ensure", 7_u32).unwrap();
            // Fresh at the instant it was written.
            let data = client
                .ensure_query_data(counting_options("ensure", calls.clone()), false)
                .await
                .unwrap();
            assert_eq!(data, 7);
            assert_eq!(calls.get(), 0);

            tokio::time::sleep(Duration::from_millis(1)).await;
            let data = client
                .ensure_query_data(counting_options("ensure", calls.clone()), false)
                .await
                .unwrap();
            assert_eq!(data, 1);
            assert_eq!(calls.get(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_query_data_revalidates_stale_cache_in_background() {
        run_local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            client.set_query_data("ensure", 7_u32).unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;

            let data = client
                .ensure_query_data(counting_options("ensure", calls.clone()), true)
                .await
                .unwrap();
            assert_eq!(data, 7);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(calls.get(), 1);
            assert_eq!(client.get_query_data::<u32>(&QueryKey::from("ensure")), Some(1));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_query_reports_errors_only_when_asked() {
        run_local(async {
            let client = QueryClient::default();
            let options = QueryOptions::<u32>::new("prefetch")
                .set_query_fn(|_| async { Err(FetchError::msg("offline")) });

            assert!(client.prefetch_query(options.clone(), false).await.is_ok());
            let error = client.prefetch_query(options, true).await.unwrap_err();
            assert_eq!(error.fetch_error().map(ToString::to_string).as_deref(), Some("offline"));

            let calls = Rc::new(Cell::new(0));
            client
                .prefetch_query(counting_options("warm", calls.clone()), true)
                .await
                .unwrap();
            assert_eq!(client.get_query_data::<u32>(&QueryKey::from("warm")), Some(1));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn per_key_defaults_apply_between_client_and_call() {
        run_local(async {
            let client = QueryClient::default();
            client.set_query_defaults(
                "todos",
                QueryOverrides {
                    stale_time: Some(StaleTime::Infinite),
                    gc_time: Some(GcTime::Infinite),
                    ..QueryOverrides::default()
                },
            );
            let options = client.default_query_options(
                QueryOptions::<u32>::new(QueryKey::from(vec![serde_json::json!("todos"), serde_json::json!(1)]))
                    .set_gc_time(Duration::from_secs(1)),
            );
            assert_eq!(options.config.stale_time, StaleTime::Infinite);
            assert_eq!(options.config.gc_time, GcTime::Duration(Duration::from_secs(1)));

            let other = client.default_query_options(QueryOptions::<u32>::new("users"));
            assert_eq!(other.config.stale_time, StaleTime::default());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_without_observers_refetches_nothing_by_default() {
        run_local(async {
            let client = QueryClient::default();
            client.set_query_data("todos", 1_u32).unwrap();
            client
                .invalidate_queries(QueryFilters::key("todos"), InvalidateOptions::default())
                .await;
            let state = client.get_query_state::<u32>(&QueryKey::from("todos")).unwrap();
            assert!(state.is_invalidated);
            assert_eq!(state.fetch_status, FetchStatus::Idle);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_queries_reverts_state() {
        run_local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            let options = counting_options("cancel", calls.clone());
            let fetch = client.fetch_query(options);
            let cancel = async {
                tokio::task::yield_now().await;
                assert_eq!(client.is_fetching(&QueryFilters::default()), 1);
                client
                    .cancel_queries(&QueryFilters::key("cancel"), CancelOptions::default())
                    .await;
            };
            let (result, ()) = futures::join!(fetch, cancel);
            assert!(result.unwrap_err().is_cancelled());
            let state = client.get_query_state::<u32>(&QueryKey::from("cancel")).unwrap();
            assert_eq!(state.status, QueryStatus::Pending);
            assert_eq!(state.fetch_status, FetchStatus::Idle);
            assert_eq!(client.is_fetching(&QueryFilters::default()), 0);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_cancel_leaves_query_fetchable() {
        run_local(async {
            let client = QueryClient::default();
            let calls = Rc::new(Cell::new(0));
            let fetch = client.fetch_query(counting_options("silent", calls.clone()));
            let cancel = async {
                tokio::task::yield_now().await;
                client
                    .cancel_queries(
                        &QueryFilters::key("silent"),
                        CancelOptions {
                            revert: true,
                            silent: true,
                        },
                    )
                    .await;
            };
            let (result, ()) = futures::join!(fetch, cancel);
            assert!(result.unwrap_err().is_cancelled());

            tokio::time::sleep(Duration::from_millis(50)).await;
            let state = client.get_query_state::<u32>(&QueryKey::from("silent")).unwrap();
            assert_eq!(state.fetch_status, FetchStatus::Idle);
            assert_eq!(client.is_fetching(&QueryFilters::default()), 0);

            let data = client
                .fetch_query(counting_options("silent", calls.clone()))
                .await
                .unwrap();
            assert_eq!(data, 2);
            assert_eq!(calls.get(), 2);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn remove_and_clear() {
        run_local(async {
            let client = QueryClient::default();
            client.set_query_data(QueryKey::from(vec![serde_json::json!("todos"), serde_json::json!(1)]), 1_u32).unwrap();
            client.set_query_data(QueryKey::from(vec![serde_json::json!("todos"), serde_json::json!(2)]), 2_u32).unwrap();
            client.set_query_data("users", 3_u32).unwrap();

            let todos = client.get_queries_data::<u32>(&QueryFilters::key("todos"));
            assert_eq!(todos.len(), 2);

            client.remove_queries(&QueryFilters::key("todos"));
            assert_eq!(client.query_cache().get_all().len(), 1);
            client.clear();
            assert!(client.query_cache().get_all().is_empty());
        })
        .await;
    }
}
