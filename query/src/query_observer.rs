use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    rc::{Rc, Weak},
    time::Duration,
};

use slotmap::SlotMap;

use crate::{
    cache_observer::QueryCacheEvent,
    query::{next_observer_key, AnyQuery, FetchOptions, ObserverKey, Query, QueryId, QueryListener, QueryPromise},
    query_options::{
        DefaultedQueryOptions, NotifyOnChangeProps, PlaceholderData, QueryOptions, RefetchOn,
        StaleTime, StructuralSharing,
    },
    query_result::{QueryObserverResult, ResultProp, TrackedQueryResult},
    query_state::{FetchStatus, QueryStatus},
    retryer::can_fetch,
    util::{set_interval, set_timeout, TimeoutHandle},
    FetchError, Instant, QueryClient, QueryError, QueryValue, SelectedValue,
};

slotmap::new_key_type! {
    /// Handle of an observer listener.
    pub struct ListenerKey;
}

/// Derives the observed value from the cached data.
pub type SelectFn<V, S> = Rc<dyn Fn(&V) -> Result<S, FetchError>>;

/// Query options plus the observer's `select` function.
pub struct ObserverOptions<V, S> {
    /// Options of the observed query.
    pub query: QueryOptions<V>,
    /// Derives the observed value. Recomputed only when the data or the function changes.
    pub select: SelectFn<V, S>,
}

impl<V: Clone, S> Clone for ObserverOptions<V, S> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            select: self.select.clone(),
        }
    }
}

impl<V, S> ObserverOptions<V, S> {
    /// Observes `query` through `select`.
    pub fn with_select(query: QueryOptions<V>, select: impl Fn(&V) -> Result<S, FetchError> + 'static) -> Self {
        Self {
            query,
            select: Rc::new(select),
        }
    }
}

impl<V: Clone + 'static> From<QueryOptions<V>> for ObserverOptions<V, V> {
    fn from(query: QueryOptions<V>) -> Self {
        Self {
            query,
            select: Rc::new(|data: &V| Ok(data.clone())),
        }
    }
}

type Listener<S> = Rc<dyn Fn(&QueryObserverResult<S>)>;

struct SelectMemo<S> {
    query_id: QueryId,
    data_update_count: u32,
    data_updated_at: Option<Instant>,
    select: *const (),
    result: S,
}

/// Binds one consumer's options to a query and computes the result it sees.
pub struct QueryObserver<V, S = V> {
    inner: Rc<ObserverInner<V, S>>,
}

impl<V, S> Clone for QueryObserver<V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning handle of a [`QueryObserver`].
pub(crate) struct WeakQueryObserver<V, S = V> {
    inner: Weak<ObserverInner<V, S>>,
}

impl<V, S> WeakQueryObserver<V, S> {
    pub(crate) fn upgrade(&self) -> Option<QueryObserver<V, S>> {
        self.inner.upgrade().map(|inner| QueryObserver { inner })
    }
}

struct ObserverInner<V, S> {
    this: Weak<ObserverInner<V, S>>,
    key: ObserverKey,
    client: QueryClient,
    options: RefCell<DefaultedQueryOptions<V>>,
    select: RefCell<SelectFn<V, S>>,
    query: RefCell<Query<V>>,
    // Update counts of the query when it was bound, for `is_fetched_after_mount`.
    query_initial_counts: Cell<(u32, u32)>,
    current_result: RefCell<QueryObserverResult<S>>,
    select_memo: RefCell<Option<SelectMemo<S>>>,
    select_error: RefCell<Option<FetchError>>,
    last_query_with_data: RefCell<Option<Query<V>>>,
    result_placeholder: RefCell<Option<PlaceholderData<V>>>,
    tracked_props: Rc<RefCell<HashSet<ResultProp>>>,
    listeners: RefCell<SlotMap<ListenerKey, Listener<S>>>,
    notify_pending: Cell<bool>,
    stale_timeout: RefCell<Option<TimeoutHandle>>,
    refetch_interval: RefCell<Option<TimeoutHandle>>,
    current_refetch_interval: Cell<Option<Duration>>,
}

fn is_stale<V: QueryValue>(query: &Query<V>, options: &DefaultedQueryOptions<V>) -> bool {
    options.config.enabled && query.is_stale_by_time(options.config.stale_time)
}

fn should_load_on_mount<V: QueryValue>(query: &Query<V>, options: &DefaultedQueryOptions<V>) -> bool {
    options.config.enabled
        && query.with_state(|state| {
            state.data.is_none()
                && !(state.status == QueryStatus::Error && !options.config.retry_on_mount)
        })
}

fn should_fetch_on<V: QueryValue>(
    query: &Query<V>,
    options: &DefaultedQueryOptions<V>,
    policy: &RefetchOn,
) -> bool {
    if !options.config.enabled || options.config.stale_time == StaleTime::Static {
        return false;
    }
    match policy.resolve(query) {
        RefetchOn::Always => true,
        RefetchOn::Never => false,
        _ => is_stale(query, options),
    }
}

fn should_fetch_on_mount<V: QueryValue>(query: &Query<V>, options: &DefaultedQueryOptions<V>) -> bool {
    should_load_on_mount(query, options)
        || (query.with_state(|state| state.data.is_some())
            && should_fetch_on(query, options, &options.config.refetch_on_mount))
}

fn should_fetch_optionally<V: QueryValue>(
    query: &Query<V>,
    prev_query: &Query<V>,
    options: &DefaultedQueryOptions<V>,
    prev_options: &DefaultedQueryOptions<V>,
) -> bool {
    (!query.ptr_eq(prev_query) || !prev_options.config.enabled) && is_stale(query, options)
}

fn replace_selected<V, S: SelectedValue>(
    sharing: &StructuralSharing<V>,
    prev: Option<&S>,
    next: S,
) -> S {
    match (sharing, prev) {
        (StructuralSharing::Disabled, _) | (_, None) => next,
        (_, Some(prev)) => S::replace_equal_deep(prev, next),
    }
}

impl<V: QueryValue, S: SelectedValue> QueryObserver<V, S> {
    /// Creates an observer. It fetches only once a listener subscribes.
    pub fn new(client: &QueryClient, options: impl Into<ObserverOptions<V, S>>) -> Result<Self, QueryError> {
        let options = options.into();
        let defaulted = client.default_query_options(options.query);
        let query = client.query_cache().build(defaulted.clone())?;
        query.set_options(defaulted.clone());
        let initial_counts = query.with_state(|state| (state.data_update_count, state.error_update_count));

        let inner = Rc::new_cyclic(|this| ObserverInner {
            this: this.clone(),
            key: next_observer_key(),
            client: client.clone(),
            options: RefCell::new(defaulted),
            select: RefCell::new(options.select),
            query: RefCell::new(query),
            query_initial_counts: Cell::new(initial_counts),
            current_result: RefCell::new(QueryObserverResult::default()),
            select_memo: RefCell::new(None),
            select_error: RefCell::new(None),
            last_query_with_data: RefCell::new(None),
            result_placeholder: RefCell::new(None),
            tracked_props: Rc::new(RefCell::new(HashSet::new())),
            listeners: RefCell::new(SlotMap::with_key()),
            notify_pending: Cell::new(false),
            stale_timeout: RefCell::new(None),
            refetch_interval: RefCell::new(None),
            current_refetch_interval: Cell::new(None),
        });
        inner.update_result();
        Ok(Self { inner })
    }

    /// Registers a listener. The first listener binds the observer to its query,
    /// which may trigger a fetch.
    pub fn subscribe(&self, listener: impl Fn(&QueryObserverResult<S>) + 'static) -> ListenerKey {
        let (key, first) = {
            let mut listeners = self.inner.listeners.borrow_mut();
            let key = listeners.insert(Rc::new(listener));
            (key, listeners.len() == 1)
        };
        if first {
            self.inner.on_subscribe();
        }
        key
    }

    /// Removes a listener. Removing the last one unbinds the observer.
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        let (removed, empty) = {
            let mut listeners = self.inner.listeners.borrow_mut();
            let removed = listeners.remove(key).is_some();
            (removed, listeners.is_empty())
        };
        if removed && empty {
            self.inner.destroy();
        }
        removed
    }

    pub(crate) fn downgrade(&self) -> WeakQueryObserver<V, S> {
        WeakQueryObserver {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Whether any listener is subscribed.
    pub fn has_listeners(&self) -> bool {
        self.inner.has_listeners()
    }

    /// Removes every listener and unbinds the observer.
    pub fn destroy(&self) {
        self.inner.listeners.borrow_mut().clear();
        self.inner.destroy();
    }

    /// Replaces the options, switching queries when the key changed.
    pub fn set_options(&self, options: impl Into<ObserverOptions<V, S>>) -> Result<(), QueryError> {
        self.inner.set_options(options.into())
    }

    /// The last computed result.
    pub fn get_current_result(&self) -> QueryObserverResult<S> {
        self.inner.current_result.borrow().clone()
    }

    /// The last computed result, recording which properties the consumer reads.
    pub fn tracked_result(&self) -> TrackedQueryResult<S> {
        TrackedQueryResult::new(self.get_current_result(), self.inner.tracked_props.clone())
    }

    /// The query currently observed.
    pub fn get_current_query(&self) -> Query<V> {
        self.inner.query.borrow().clone()
    }

    /// The result `options` would produce right now, including a fetch that mounting would start.
    pub fn get_optimistic_result(
        &self,
        options: impl Into<ObserverOptions<V, S>>,
    ) -> Result<QueryObserverResult<S>, QueryError> {
        let options = options.into();
        let defaulted = self.inner.client.default_query_options(options.query);
        let query = self.inner.client.query_cache().build(defaulted.clone())?;
        Ok(self
            .inner
            .create_result(&query, &defaulted, &options.select, true))
    }

    /// Refetches, cancelling a fetch in flight when data is cached.
    pub async fn refetch(&self) -> QueryObserverResult<S> {
        self.fetch(FetchOptions {
            cancel_refetch: true,
            ..FetchOptions::default()
        })
        .await
    }

    /// Fetches with `fetch_options` and returns the updated result. Errors end up in the result.
    pub async fn fetch(&self, fetch_options: FetchOptions) -> QueryObserverResult<S> {
        if let Some(promise) = self.inner.execute_fetch(fetch_options) {
            let _ = promise.await;
        }
        self.inner.update_result();
        self.get_current_result()
    }

    /// Fetches the query `options` points to and computes its result, without binding to it.
    pub async fn fetch_optimistic(
        &self,
        options: impl Into<ObserverOptions<V, S>>,
    ) -> Result<QueryObserverResult<S>, QueryError> {
        let options = options.into();
        let defaulted = self.inner.client.default_query_options(options.query);
        let query = self.inner.client.query_cache().build(defaulted.clone())?;
        query
            .fetch(Some(defaulted.clone()), FetchOptions::default())
            .await?;
        Ok(self
            .inner
            .create_result(&query, &defaulted, &options.select, false))
    }
}

impl<V: QueryValue, S: SelectedValue> ObserverInner<V, S> {
    fn has_listeners(&self) -> bool {
        !self.listeners.borrow().is_empty()
    }

    fn listener_handle(&self) -> Weak<dyn QueryListener> {
        self.this.clone()
    }

    fn on_subscribe(&self) {
        let query = self.query.borrow().clone();
        query.add_observer(self.key, self.listener_handle());
        let options = self.options.borrow().clone();
        if should_fetch_on_mount(&query, &options) {
            drop(self.execute_fetch(FetchOptions::default()));
        } else {
            self.update_result();
        }
        self.update_timers();
    }

    fn destroy(&self) {
        self.clear_stale_timeout();
        self.clear_refetch_interval();
        let query = self.query.borrow().clone();
        query.remove_observer(self.key);
    }

    fn set_options(&self, options: ObserverOptions<V, S>) -> Result<(), QueryError> {
        let prev_options = self.options.borrow().clone();
        let prev_query = self.query.borrow().clone();

        let defaulted = self.client.default_query_options(options.query);
        *self.options.borrow_mut() = defaulted.clone();
        *self.select.borrow_mut() = options.select;
        prev_query.notify_cache(QueryCacheEvent::ObserverOptionsUpdated);

        self.update_query()?;
        let query = self.query.borrow().clone();
        query.set_options(defaulted.clone());

        let mounted = self.has_listeners();
        if mounted && should_fetch_optionally(&query, &prev_query, &defaulted, &prev_options) {
            drop(self.execute_fetch(FetchOptions::default()));
        }

        self.update_result();

        let query_changed = !query.ptr_eq(&prev_query);
        let enabled_changed = defaulted.config.enabled != prev_options.config.enabled;
        if mounted
            && (query_changed
                || enabled_changed
                || defaulted.config.stale_time != prev_options.config.stale_time)
        {
            self.update_stale_timeout();
        }

        let next_interval = self.compute_refetch_interval();
        if mounted
            && (query_changed
                || enabled_changed
                || next_interval != self.current_refetch_interval.get())
        {
            self.update_refetch_interval(next_interval);
        }
        Ok(())
    }

    /// Rebinds to the query the current options point to.
    fn update_query(&self) -> Result<(), QueryError> {
        let options = self.options.borrow().clone();
        let query = self.client.query_cache().build(options)?;
        let prev_query = self.query.borrow().clone();
        if query.ptr_eq(&prev_query) {
            return Ok(());
        }
        self.query_initial_counts.set(
            query.with_state(|state| (state.data_update_count, state.error_update_count)),
        );
        *self.query.borrow_mut() = query.clone();
        if self.has_listeners() {
            prev_query.remove_observer(self.key);
            query.add_observer(self.key, self.listener_handle());
        }
        Ok(())
    }

    fn execute_fetch(&self, fetch_options: FetchOptions) -> Option<QueryPromise<V>> {
        if let Err(error) = self.update_query() {
            tracing::warn!(%error, "observer could not rebind its query");
            return None;
        }
        let query = self.query.borrow().clone();
        let options = self.options.borrow().clone();
        Some(query.fetch(Some(options), fetch_options))
    }

    fn create_result(
        &self,
        query: &Query<V>,
        options: &DefaultedQueryOptions<V>,
        select: &SelectFn<V, S>,
        optimistic: bool,
    ) -> QueryObserverResult<S> {
        let current_query = self.query.borrow().clone();
        let query_changed = !query.ptr_eq(&current_query);
        let (initial_data_updates, initial_error_updates) = if query_changed {
            query.with_state(|state| (state.data_update_count, state.error_update_count))
        } else {
            self.query_initial_counts.get()
        };
        let prev_result = self.current_result.borrow().clone();

        let mut state = query.state();
        if optimistic {
            let mounted = self.has_listeners();
            let fetch_on_mount = !mounted && should_fetch_on_mount(query, options);
            let fetch_optionally = mounted
                && should_fetch_optionally(query, &current_query, options, &self.options.borrow());
            if fetch_on_mount || fetch_optionally {
                state.fetch_failure_count = 0;
                state.fetch_failure_reason = None;
                state.fetch_status = if can_fetch(options.config.network_mode, self.client.environment()) {
                    FetchStatus::Fetching
                } else {
                    FetchStatus::Paused
                };
                if state.data.is_none() {
                    state.error = None;
                    state.status = QueryStatus::Pending;
                }
            }
        }

        let mut error = state.error.clone();
        let mut error_updated_at = state.error_updated_at;
        let mut status = state.status;
        let mut is_placeholder_data = false;

        let mut data = match &state.data {
            Some(value) => {
                let memo_hit = self.select_memo.borrow().as_ref().filter(|memo| {
                    memo.query_id == query.id()
                        && memo.data_update_count == state.data_update_count
                        && memo.data_updated_at == state.data_updated_at
                        && memo.select == Rc::as_ptr(select) as *const ()
                }).map(|memo| memo.result.clone());
                match memo_hit {
                    Some(result) => Some(result),
                    None => match select(value) {
                        Ok(selected) => {
                            let selected = replace_selected(
                                &options.structural_sharing,
                                prev_result.data.as_ref(),
                                selected,
                            );
                            *self.select_memo.borrow_mut() = Some(SelectMemo {
                                query_id: query.id(),
                                data_update_count: state.data_update_count,
                                data_updated_at: state.data_updated_at,
                                select: Rc::as_ptr(select) as *const (),
                                result: selected.clone(),
                            });
                            *self.select_error.borrow_mut() = None;
                            Some(selected)
                        }
                        Err(select_error) => {
                            *self.select_error.borrow_mut() = Some(select_error);
                            None
                        }
                    },
                }
            }
            None => {
                *self.select_error.borrow_mut() = None;
                None
            }
        };

        if data.is_none() && status == QueryStatus::Pending {
            if let Some(placeholder) = &options.placeholder_data {
                let reuse = prev_result.is_placeholder_data
                    && self
                        .result_placeholder
                        .borrow()
                        .as_ref()
                        .is_some_and(|prev| prev.same_as(placeholder));
                let placeholder_data = if reuse {
                    prev_result.data.clone()
                } else {
                    let previous = self
                        .last_query_with_data
                        .borrow()
                        .as_ref()
                        .and_then(|query| query.data());
                    placeholder
                        .resolve(previous.as_ref())
                        .and_then(|value| match select(&value) {
                            Ok(selected) => {
                                *self.select_error.borrow_mut() = None;
                                Some(selected)
                            }
                            Err(select_error) => {
                                *self.select_error.borrow_mut() = Some(select_error);
                                None
                            }
                        })
                };
                if let Some(placeholder_data) = placeholder_data {
                    status = QueryStatus::Success;
                    data = Some(replace_selected(
                        &options.structural_sharing,
                        prev_result.data.as_ref(),
                        placeholder_data,
                    ));
                    is_placeholder_data = true;
                }
            }
        }

        if let Some(select_error) = self.select_error.borrow().clone() {
            error = Some(select_error);
            data = self
                .select_memo
                .borrow()
                .as_ref()
                .map(|memo| memo.result.clone());
            error_updated_at = Some(Instant::now());
            status = QueryStatus::Error;
        }

        let is_fetching = state.fetch_status == FetchStatus::Fetching;
        let is_pending = status == QueryStatus::Pending;
        let is_error = status == QueryStatus::Error;
        let has_data = data.is_some();

        QueryObserverResult {
            data,
            data_updated_at: state.data_updated_at,
            error_updated_at,
            error_update_count: state.error_update_count,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            is_error,
            is_fetched: state.data_update_count > 0 || state.error_update_count > 0,
            is_fetched_after_mount: state.data_update_count > initial_data_updates
                || state.error_update_count > initial_error_updates,
            is_fetching,
            is_loading: is_pending && is_fetching,
            is_loading_error: is_error && !has_data,
            is_paused: state.fetch_status == FetchStatus::Paused,
            is_pending,
            is_placeholder_data,
            // A failed background refetch keeps the data and reports the error alongside it.
            is_refetch_error: error.is_some() && has_data && !is_placeholder_data,
            is_refetching: is_fetching && !is_pending,
            is_stale: is_stale(query, options),
            is_success: status == QueryStatus::Success,
            status,
            fetch_status: state.fetch_status,
            error,
        }
    }

    fn update_result(&self) {
        let query = self.query.borrow().clone();
        let options = self.options.borrow().clone();
        let select = self.select.borrow().clone();
        let next = self.create_result(&query, &options, &select, false);

        if query.with_state(|state| state.data.is_some()) {
            *self.last_query_with_data.borrow_mut() = Some(query.clone());
        }
        *self.result_placeholder.borrow_mut() = options.placeholder_data.clone();

        let changed = {
            let prev = self.current_result.borrow();
            if *prev == next {
                return;
            }
            prev.changed_props(&next)
        };
        *self.current_result.borrow_mut() = next;

        let notify_listeners = match &options.config.notify_on_change_props {
            NotifyOnChangeProps::All => true,
            NotifyOnChangeProps::Props(props) => changed.iter().any(|prop| props.contains(prop)),
            NotifyOnChangeProps::Tracked => {
                let tracked = self.tracked_props.borrow();
                tracked.is_empty() || changed.iter().any(|prop| tracked.contains(prop))
            }
        };
        self.notify(&query, notify_listeners);
    }

    fn notify(&self, query: &Query<V>, listeners: bool) {
        let env = self.client.environment().clone();
        env.notify.batch(|| {
            if listeners && !self.notify_pending.replace(true) {
                let this = self.this.clone();
                env.notify.schedule(move || {
                    if let Some(inner) = this.upgrade() {
                        inner.notify_pending.set(false);
                        let result = inner.current_result.borrow().clone();
                        let listeners: Vec<_> = inner.listeners.borrow().values().cloned().collect();
                        for listener in listeners {
                            listener(&result);
                        }
                    }
                });
            }
            query.notify_cache(QueryCacheEvent::ObserverResultsUpdated);
        });
    }

    fn update_timers(&self) {
        self.update_stale_timeout();
        self.update_refetch_interval(self.compute_refetch_interval());
    }

    fn clear_stale_timeout(&self) {
        if let Some(handle) = self.stale_timeout.borrow_mut().take() {
            handle.clear();
        }
    }

    fn update_stale_timeout(&self) {
        self.clear_stale_timeout();
        let (is_stale, data_updated_at) = {
            let result = self.current_result.borrow();
            (result.is_stale, result.data_updated_at)
        };
        let stale_time = self.options.borrow().config.stale_time;
        let (StaleTime::Duration(stale_time), Some(updated_at), false) = (stale_time, data_updated_at, is_stale) else {
            return;
        };
        let timeout = crate::util::time_until_stale(updated_at, stale_time) + Duration::from_millis(1);
        let this = self.this.clone();
        let handle = set_timeout(
            move || {
                if let Some(inner) = this.upgrade() {
                    if !inner.current_result.borrow().is_stale {
                        inner.update_result();
                    }
                }
            },
            timeout,
        );
        *self.stale_timeout.borrow_mut() = Some(handle);
    }

    fn compute_refetch_interval(&self) -> Option<Duration> {
        let query = self.query.borrow().clone();
        let interval = self.options.borrow().config.refetch_interval.clone();
        interval.resolve(&query)
    }

    fn clear_refetch_interval(&self) {
        if let Some(handle) = self.refetch_interval.borrow_mut().take() {
            handle.clear();
        }
    }

    fn update_refetch_interval(&self, next_interval: Option<Duration>) {
        self.clear_refetch_interval();
        self.current_refetch_interval.set(next_interval);
        let Some(period) = next_interval else {
            return;
        };
        if !self.options.borrow().config.enabled {
            return;
        }
        let this = self.this.clone();
        let handle = set_interval(
            move || {
                let Some(inner) = this.upgrade() else {
                    return false;
                };
                let in_background = inner.options.borrow().config.refetch_interval_in_background;
                if in_background || inner.client.environment().focus.is_focused() {
                    drop(inner.execute_fetch(FetchOptions::default()));
                }
                true
            },
            period,
        );
        *self.refetch_interval.borrow_mut() = Some(handle);
    }
}

impl<V: QueryValue, S: SelectedValue> QueryListener for ObserverInner<V, S> {
    fn on_query_update(&self) {
        self.update_result();
        if self.has_listeners() {
            self.update_timers();
        }
    }

    fn should_fetch_on_window_focus(&self) -> bool {
        let query = self.query.borrow().clone();
        let options = self.options.borrow().clone();
        should_fetch_on(&query, &options, &options.config.refetch_on_window_focus)
    }

    fn should_fetch_on_reconnect(&self) -> bool {
        let query = self.query.borrow().clone();
        let options = self.options.borrow().clone();
        should_fetch_on(&query, &options, &options.config.refetch_on_reconnect)
    }

    fn refetch_in_background(&self) {
        drop(self.execute_fetch(FetchOptions::default()));
    }

    fn is_enabled(&self) -> bool {
        self.options.borrow().config.enabled
    }

    fn is_stale(&self) -> bool {
        self.current_result.borrow().is_stale
    }
}
