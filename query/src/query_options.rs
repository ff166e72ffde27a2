use std::{fmt, rc::Rc, time::Duration};

use futures::future::LocalBoxFuture;

use crate::{
    infinite_query::QueryBehavior, query::AnyQuery, query_result::ResultProp,
    retryer::CancelSignal, FetchError, Instant, QueryKey,
};

/// Opaque metadata passed through to query functions and cache listeners.
pub type Meta = serde_json::Map<String, serde_json::Value>;

/// Function producing a query's data.
pub type QueryFn<V> = Rc<dyn Fn(QueryFunctionContext) -> LocalBoxFuture<'static, Result<V, FetchError>>>;

/// Context handed to a query function on every attempt.
#[derive(Debug, Clone)]
pub struct QueryFunctionContext {
    /// Key of the query being fetched.
    pub query_key: QueryKey,
    /// Flipped when the fetch is cancelled.
    pub signal: CancelSignal,
    /// The query's meta.
    pub meta: Option<Meta>,
}

/// Wraps an async function into a [`QueryFn`].
pub fn query_fn<V, F, Fu>(func: F) -> QueryFn<V>
where
    F: Fn(QueryFunctionContext) -> Fu + 'static,
    Fu: std::future::Future<Output = Result<V, FetchError>> + 'static,
{
    Rc::new(move |ctx| Box::pin(func(ctx)))
}

/// Whether a failed attempt is retried.
#[derive(Clone)]
pub enum Retry {
    /// Never retry.
    Never,
    /// Retry forever.
    Infinite,
    /// Retry up to this many times.
    Count(u32),
    /// Decide from the number of failures so far and the last error.
    Predicate(Rc<dyn Fn(u32, &FetchError) -> bool>),
}

impl Retry {
    /// `failure_count` is the number of failures before the current one.
    pub fn should_retry(&self, failure_count: u32, error: &FetchError) -> bool {
        match self {
            Retry::Never => false,
            Retry::Infinite => true,
            Retry::Count(count) => failure_count < *count,
            Retry::Predicate(func) => func(failure_count, error),
        }
    }
}

impl From<bool> for Retry {
    fn from(retry: bool) -> Self {
        if retry {
            Retry::Infinite
        } else {
            Retry::Never
        }
    }
}

impl From<u32> for Retry {
    fn from(count: u32) -> Self {
        Retry::Count(count)
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retry::Never => write!(f, "Never"),
            Retry::Infinite => write!(f, "Infinite"),
            Retry::Count(count) => f.debug_tuple("Count").field(count).finish(),
            Retry::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Delay before the next attempt.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// `min(1000 * 2^failure_count, 30000)` milliseconds.
    #[default]
    Exponential,
    /// Always wait the same amount.
    Fixed(Duration),
    /// Compute from the failure count and error.
    Custom(Rc<dyn Fn(u32, &FetchError) -> Duration>),
}

impl RetryDelay {
    /// Delay after `failure_count` previous failures.
    pub fn delay(&self, failure_count: u32, error: &FetchError) -> Duration {
        match self {
            RetryDelay::Exponential => default_retry_delay(failure_count),
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Custom(func) => func(failure_count, error),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Exponential => write!(f, "Exponential"),
            RetryDelay::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            RetryDelay::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Exponential backoff capped at 30 seconds.
pub fn default_retry_delay(failure_count: u32) -> Duration {
    let millis = 1000u64.saturating_mul(2u64.saturating_pow(failure_count));
    Duration::from_millis(millis.min(30_000))
}

/// How fetches behave while offline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// Pause while offline.
    #[default]
    Online,
    /// Ignore connectivity.
    Always,
    /// Attempt once, pause retries while offline.
    OfflineFirst,
}

/// How long fetched data stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleTime {
    /// Fresh for this long after the last update.
    Duration(Duration),
    /// Never stale by time, but invalidation still marks it stale.
    Infinite,
    /// Never stale, not even after invalidation.
    Static,
}

impl Default for StaleTime {
    fn default() -> Self {
        StaleTime::Duration(Duration::ZERO)
    }
}

impl From<Duration> for StaleTime {
    fn from(duration: Duration) -> Self {
        StaleTime::Duration(duration)
    }
}

/// How long an unused entry is kept before it is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcTime {
    /// Evict after this long without observers.
    Duration(Duration),
    /// Never evict.
    Infinite,
}

impl Default for GcTime {
    fn default() -> Self {
        GcTime::Duration(DEFAULT_GC_TIME)
    }
}

impl From<Duration> for GcTime {
    fn from(duration: Duration) -> Self {
        GcTime::Duration(duration)
    }
}

/// Refetch policy for mount, window focus and reconnect.
#[derive(Clone, Default)]
pub enum RefetchOn {
    /// Never refetch on this trigger.
    Never,
    /// Refetch when the data is stale.
    #[default]
    IfStale,
    /// Always refetch.
    Always,
    /// Decide per query.
    Custom(Rc<dyn Fn(&dyn AnyQuery) -> RefetchOn>),
}

impl RefetchOn {
    pub(crate) fn resolve(&self, query: &dyn AnyQuery) -> RefetchOn {
        match self {
            RefetchOn::Custom(func) => match func(query) {
                // A policy function returning another function is treated as "if stale".
                RefetchOn::Custom(_) => RefetchOn::IfStale,
                other => other,
            },
            other => other.clone(),
        }
    }
}

impl From<bool> for RefetchOn {
    fn from(refetch: bool) -> Self {
        if refetch {
            RefetchOn::IfStale
        } else {
            RefetchOn::Never
        }
    }
}

impl fmt::Debug for RefetchOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefetchOn::Never => write!(f, "Never"),
            RefetchOn::IfStale => write!(f, "IfStale"),
            RefetchOn::Always => write!(f, "Always"),
            RefetchOn::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Periodic refetching while observed.
#[derive(Clone, Default)]
pub enum RefetchInterval {
    /// No polling.
    #[default]
    Off,
    /// Poll with a fixed period.
    Every(Duration),
    /// Decide the period from the query, `None` stops polling.
    Custom(Rc<dyn Fn(&dyn AnyQuery) -> Option<Duration>>),
}

impl RefetchInterval {
    pub(crate) fn resolve(&self, query: &dyn AnyQuery) -> Option<Duration> {
        match self {
            RefetchInterval::Off => None,
            RefetchInterval::Every(period) => Some(*period),
            RefetchInterval::Custom(func) => func(query),
        }
        .filter(|period| !period.is_zero())
    }
}

impl fmt::Debug for RefetchInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefetchInterval::Off => write!(f, "Off"),
            RefetchInterval::Every(period) => f.debug_tuple("Every").field(period).finish(),
            RefetchInterval::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Which result properties trigger listener notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NotifyOnChangeProps {
    /// Only properties read through a tracked result since the last computation.
    /// Notifies on any change while nothing has been tracked.
    #[default]
    Tracked,
    /// Any change.
    All,
    /// Only these properties.
    Props(Vec<ResultProp>),
}

/// How fetched data is merged with the cached value.
#[derive(Clone, Default)]
pub enum StructuralSharing<V> {
    /// Reuse deeply equal subtrees of the previous value.
    #[default]
    Enabled,
    /// Always take the new value.
    Disabled,
    /// Custom merge of `(previous, next)`.
    Custom(Rc<dyn Fn(Option<&V>, V) -> V>),
}

impl<V: crate::StructuralShare> StructuralSharing<V> {
    pub(crate) fn replace_data(&self, prev: Option<&V>, next: V) -> V {
        match (self, prev) {
            (StructuralSharing::Disabled, _) => next,
            (StructuralSharing::Custom(func), prev) => func(prev, next),
            (StructuralSharing::Enabled, Some(prev)) => V::replace_equal_deep(prev, next),
            (StructuralSharing::Enabled, None) => next,
        }
    }
}

impl<V> fmt::Debug for StructuralSharing<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralSharing::Enabled => write!(f, "Enabled"),
            StructuralSharing::Disabled => write!(f, "Disabled"),
            StructuralSharing::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Data shown while a query has no data yet. Never written to the cache.
#[derive(Clone)]
pub enum PlaceholderData<V> {
    /// A fixed value.
    Value(V),
    /// Computed from the data of the previously observed query, if any.
    Fn(Rc<dyn Fn(Option<&V>) -> Option<V>>),
}

impl<V: Clone> PlaceholderData<V> {
    /// Keeps showing the previous query's data while the new key loads.
    pub fn keep_previous_data() -> Self {
        PlaceholderData::Fn(Rc::new(|previous: Option<&V>| previous.cloned()))
    }

    pub(crate) fn resolve(&self, previous: Option<&V>) -> Option<V> {
        match self {
            PlaceholderData::Value(value) => Some(value.clone()),
            PlaceholderData::Fn(func) => func(previous),
        }
    }

    pub(crate) fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (PlaceholderData::Fn(a), PlaceholderData::Fn(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for PlaceholderData<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceholderData::Value(value) => f.debug_tuple("Value").field(value).finish(),
            PlaceholderData::Fn(_) => write!(f, "Fn(..)"),
        }
    }
}

/// Client-wide defaults for every query.
#[derive(Debug, Clone)]
pub struct DefaultQueryOptions {
    /// Retry policy.
    pub retry: Retry,
    /// Delay between attempts.
    pub retry_delay: RetryDelay,
    /// Time before an inactive query is removed from cache.
    pub gc_time: GcTime,
    /// Time before a query is considered stale.
    pub stale_time: StaleTime,
    /// Behavior while offline.
    pub network_mode: NetworkMode,
    /// Refetch when an observer subscribes.
    pub refetch_on_mount: RefetchOn,
    /// Refetch when the app regains focus.
    pub refetch_on_window_focus: RefetchOn,
    /// Refetch when connectivity comes back.
    pub refetch_on_reconnect: RefetchOn,
    /// Polling period.
    pub refetch_interval: RefetchInterval,
    /// Keep polling while unfocused.
    pub refetch_interval_in_background: bool,
    /// Retry a failed query when a new observer mounts.
    pub retry_on_mount: bool,
    /// Whether observers fetch automatically.
    pub enabled: bool,
    /// Which result properties notify listeners.
    pub notify_on_change_props: NotifyOnChangeProps,
    /// Whether structural sharing is applied.
    pub structural_sharing: bool,
    /// Metadata.
    pub meta: Option<Meta>,
}

impl Default for DefaultQueryOptions {
    fn default() -> Self {
        Self {
            retry: Retry::Count(3),
            retry_delay: RetryDelay::default(),
            gc_time: GcTime::default(),
            stale_time: StaleTime::default(),
            network_mode: NetworkMode::default(),
            refetch_on_mount: RefetchOn::IfStale,
            refetch_on_window_focus: RefetchOn::IfStale,
            refetch_on_reconnect: RefetchOn::IfStale,
            refetch_interval: RefetchInterval::Off,
            refetch_interval_in_background: false,
            retry_on_mount: true,
            enabled: true,
            notify_on_change_props: NotifyOnChangeProps::default(),
            structural_sharing: true,
            meta: None,
        }
    }
}

const DEFAULT_GC_TIME: Duration = Duration::from_secs(60 * 5);

/// Partial, untyped option overrides. Unset fields fall back to the next layer.
#[derive(Debug, Clone, Default)]
pub struct QueryOverrides {
    /// Retry policy.
    pub retry: Option<Retry>,
    /// Delay between attempts.
    pub retry_delay: Option<RetryDelay>,
    /// Time before an inactive query is removed from cache.
    pub gc_time: Option<GcTime>,
    /// Time before a query is considered stale.
    pub stale_time: Option<StaleTime>,
    /// Behavior while offline.
    pub network_mode: Option<NetworkMode>,
    /// Refetch when an observer subscribes.
    pub refetch_on_mount: Option<RefetchOn>,
    /// Refetch when the app regains focus.
    pub refetch_on_window_focus: Option<RefetchOn>,
    /// Refetch when connectivity comes back.
    pub refetch_on_reconnect: Option<RefetchOn>,
    /// Polling period.
    pub refetch_interval: Option<RefetchInterval>,
    /// Keep polling while unfocused.
    pub refetch_interval_in_background: Option<bool>,
    /// Retry a failed query when a new observer mounts.
    pub retry_on_mount: Option<bool>,
    /// Whether observers fetch automatically.
    pub enabled: Option<bool>,
    /// Which result properties notify listeners.
    pub notify_on_change_props: Option<NotifyOnChangeProps>,
    /// Metadata.
    pub meta: Option<Meta>,
}

impl QueryOverrides {
    /// Writes every set field over `defaults`.
    pub fn apply_to(&self, defaults: &mut DefaultQueryOptions) {
        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(value) = &self.$field {
                    defaults.$field = value.clone();
                })*
            };
        }
        apply!(
            retry,
            retry_delay,
            gc_time,
            stale_time,
            network_mode,
            refetch_on_mount,
            refetch_on_window_focus,
            refetch_on_reconnect,
            refetch_interval,
            refetch_interval_in_background,
            retry_on_mount,
            enabled,
            notify_on_change_props
        );
        if let Some(meta) = &self.meta {
            defaults.meta = Some(meta.clone());
        }
    }
}

/// Options for one query, as passed to the client, a cache or an observer.
pub struct QueryOptions<V> {
    /// Identity of the query.
    pub query_key: QueryKey,
    /// Explicit hash, overriding the canonical hash of `query_key`.
    pub query_hash: Option<String>,
    /// Function producing the data.
    pub query_fn: Option<QueryFn<V>>,
    /// Untyped overrides of the client defaults.
    pub overrides: QueryOverrides,
    /// How fetched data is merged with cached data.
    pub structural_sharing: Option<StructuralSharing<V>>,
    /// Shown while the query has no data. Never cached.
    pub placeholder_data: Option<PlaceholderData<V>>,
    /// Seeds the cache when the entry is created.
    pub initial_data: Option<V>,
    /// When `initial_data` was produced. Defaults to creation time.
    pub initial_data_updated_at: Option<Instant>,
    /// Fetch strategy, e.g. page assembly for infinite queries.
    pub behavior: Option<Rc<dyn QueryBehavior<V>>>,
}

impl<V: Clone> Clone for QueryOptions<V> {
    fn clone(&self) -> Self {
        Self {
            query_key: self.query_key.clone(),
            query_hash: self.query_hash.clone(),
            query_fn: self.query_fn.clone(),
            overrides: self.overrides.clone(),
            structural_sharing: self.structural_sharing.clone(),
            placeholder_data: self.placeholder_data.clone(),
            initial_data: self.initial_data.clone(),
            initial_data_updated_at: self.initial_data_updated_at,
            behavior: self.behavior.clone(),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for QueryOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_key", &self.query_key)
            .field("query_hash", &self.query_hash)
            .field("query_fn", &self.query_fn.as_ref().map(|_| ".."))
            .field("overrides", &self.overrides)
            .field("structural_sharing", &self.structural_sharing)
            .field("placeholder_data", &self.placeholder_data)
            .field("initial_data", &self.initial_data)
            .finish()
    }
}

impl<V> QueryOptions<V> {
    /// Options for `query_key` with everything else defaulted.
    pub fn new(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: query_key.into(),
            query_hash: None,
            query_fn: None,
            overrides: QueryOverrides::default(),
            structural_sharing: None,
            placeholder_data: None,
            initial_data: None,
            initial_data_updated_at: None,
            behavior: None,
        }
    }

    /// Set the query function.
    pub fn set_query_fn<F, Fu>(self, func: F) -> Self
    where
        F: Fn(QueryFunctionContext) -> Fu + 'static,
        Fu: std::future::Future<Output = Result<V, FetchError>> + 'static,
    {
        QueryOptions {
            query_fn: Some(query_fn(func)),
            ..self
        }
    }

    /// Set the stale time.
    pub fn set_stale_time(mut self, stale_time: impl Into<StaleTime>) -> Self {
        self.overrides.stale_time = Some(stale_time.into());
        self
    }

    /// Set the gc time.
    pub fn set_gc_time(mut self, gc_time: impl Into<GcTime>) -> Self {
        self.overrides.gc_time = Some(gc_time.into());
        self
    }

    /// Set the retry policy.
    pub fn set_retry(mut self, retry: impl Into<Retry>) -> Self {
        self.overrides.retry = Some(retry.into());
        self
    }

    /// Set the retry delay.
    pub fn set_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.overrides.retry_delay = Some(retry_delay);
        self
    }

    /// Set the network mode.
    pub fn set_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.overrides.network_mode = Some(network_mode);
        self
    }

    /// Set the refetch interval.
    pub fn set_refetch_interval(mut self, refetch_interval: RefetchInterval) -> Self {
        self.overrides.refetch_interval = Some(refetch_interval);
        self
    }

    /// Set the refetch-on-mount policy.
    pub fn set_refetch_on_mount(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.overrides.refetch_on_mount = Some(refetch.into());
        self
    }

    /// Set the refetch-on-window-focus policy.
    pub fn set_refetch_on_window_focus(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.overrides.refetch_on_window_focus = Some(refetch.into());
        self
    }

    /// Set the refetch-on-reconnect policy.
    pub fn set_refetch_on_reconnect(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.overrides.refetch_on_reconnect = Some(refetch.into());
        self
    }

    /// Enable or disable automatic fetching.
    pub fn set_enabled(mut self, enabled: bool) -> Self {
        self.overrides.enabled = Some(enabled);
        self
    }

    /// Set which result properties notify listeners.
    pub fn set_notify_on_change_props(mut self, props: NotifyOnChangeProps) -> Self {
        self.overrides.notify_on_change_props = Some(props);
        self
    }

    /// Set the metadata.
    pub fn set_meta(mut self, meta: Meta) -> Self {
        self.overrides.meta = Some(meta);
        self
    }

    /// Set the structural sharing policy.
    pub fn set_structural_sharing(self, structural_sharing: StructuralSharing<V>) -> Self {
        QueryOptions {
            structural_sharing: Some(structural_sharing),
            ..self
        }
    }

    /// Set the placeholder data.
    pub fn set_placeholder_data(self, placeholder_data: PlaceholderData<V>) -> Self {
        QueryOptions {
            placeholder_data: Some(placeholder_data),
            ..self
        }
    }

    /// Set the initial data.
    pub fn set_initial_data(self, initial_data: V) -> Self {
        QueryOptions {
            initial_data: Some(initial_data),
            ..self
        }
    }
}

/// Query options merged with every default layer. This is what queries and observers act on.
pub struct DefaultedQueryOptions<V> {
    /// Identity of the query.
    pub query_key: QueryKey,
    /// Canonical (or overridden) hash.
    pub query_hash: String,
    /// Function producing the data.
    pub query_fn: Option<QueryFn<V>>,
    /// Effective untyped configuration.
    pub config: DefaultQueryOptions,
    /// How fetched data is merged with cached data.
    pub structural_sharing: StructuralSharing<V>,
    /// Shown while the query has no data.
    pub placeholder_data: Option<PlaceholderData<V>>,
    /// Seeds the cache when the entry is created.
    pub initial_data: Option<V>,
    /// When `initial_data` was produced.
    pub initial_data_updated_at: Option<Instant>,
    /// Fetch strategy.
    pub behavior: Option<Rc<dyn QueryBehavior<V>>>,
}

impl<V: Clone> Clone for DefaultedQueryOptions<V> {
    fn clone(&self) -> Self {
        Self {
            query_key: self.query_key.clone(),
            query_hash: self.query_hash.clone(),
            query_fn: self.query_fn.clone(),
            config: self.config.clone(),
            structural_sharing: self.structural_sharing.clone(),
            placeholder_data: self.placeholder_data.clone(),
            initial_data: self.initial_data.clone(),
            initial_data_updated_at: self.initial_data_updated_at,
            behavior: self.behavior.clone(),
        }
    }
}

impl<V> DefaultedQueryOptions<V> {
    /// Merges `options` over `defaults`. Per-call options win.
    pub fn resolve(options: QueryOptions<V>, mut defaults: DefaultQueryOptions) -> Self {
        options.overrides.apply_to(&mut defaults);
        let config = validate(defaults);
        let structural_sharing = options.structural_sharing.unwrap_or(if config.structural_sharing {
            StructuralSharing::Enabled
        } else {
            StructuralSharing::Disabled
        });
        let query_hash = options
            .query_hash
            .unwrap_or_else(|| crate::hash_key(&options.query_key));
        Self {
            query_key: options.query_key,
            query_hash,
            query_fn: options.query_fn,
            config,
            structural_sharing,
            placeholder_data: options.placeholder_data,
            initial_data: options.initial_data,
            initial_data_updated_at: options.initial_data_updated_at,
            behavior: options.behavior,
        }
    }
}

/// Ensures that stale_time never exceeds gc_time.
fn validate(mut options: DefaultQueryOptions) -> DefaultQueryOptions {
    if let (StaleTime::Duration(stale_time), GcTime::Duration(gc_time)) =
        (options.stale_time, options.gc_time)
    {
        if stale_time > gc_time {
            tracing::warn!(
                stale_time = stale_time.as_millis() as u64,
                gc_time = gc_time.as_millis() as u64,
                "stale_time is greater than gc_time, using gc_time instead"
            );
            options.stale_time = StaleTime::Duration(gc_time);
        }
    }
    options
}
