use std::{cell::RefCell, collections::HashSet, rc::Rc};

use crate::{
    query_state::{FetchStatus, QueryStatus},
    FetchError, Instant,
};

/// A property of [`QueryObserverResult`], used for change tracking.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultProp {
    Data,
    DataUpdatedAt,
    Error,
    ErrorUpdatedAt,
    ErrorUpdateCount,
    FailureCount,
    FailureReason,
    IsError,
    IsFetched,
    IsFetchedAfterMount,
    IsFetching,
    IsLoading,
    IsLoadingError,
    IsPaused,
    IsPending,
    IsPlaceholderData,
    IsRefetchError,
    IsRefetching,
    IsStale,
    IsSuccess,
    Status,
    FetchStatus,
}

/// What an observer hands to its consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryObserverResult<S> {
    /// Selected data, or placeholder data.
    pub data: Option<S>,
    /// When the cached data was last updated.
    pub data_updated_at: Option<Instant>,
    /// The query error, or the error of the `select` function.
    pub error: Option<FetchError>,
    /// When the error was last set.
    pub error_updated_at: Option<Instant>,
    /// Number of errors of the query.
    pub error_update_count: u32,
    /// Failed attempts of the current or last fetch.
    pub failure_count: u32,
    /// Error of the last failed attempt.
    pub failure_reason: Option<FetchError>,
    /// `status == Error`.
    pub is_error: bool,
    /// The query has fetched at least once.
    pub is_fetched: bool,
    /// The query has fetched since this observer mounted.
    pub is_fetched_after_mount: bool,
    /// A fetch is in flight.
    pub is_fetching: bool,
    /// First fetch in flight.
    pub is_loading: bool,
    /// The first fetch failed.
    pub is_loading_error: bool,
    /// A fetch waits for connectivity.
    pub is_paused: bool,
    /// No data yet.
    pub is_pending: bool,
    /// `data` is placeholder data.
    pub is_placeholder_data: bool,
    /// A refetch failed while data is cached.
    pub is_refetch_error: bool,
    /// Background refetch in flight.
    pub is_refetching: bool,
    /// The data is stale.
    pub is_stale: bool,
    /// `status == Success`.
    pub is_success: bool,
    /// Data status.
    pub status: QueryStatus,
    /// Fetch status.
    pub fetch_status: FetchStatus,
}

impl<S> Default for QueryObserverResult<S> {
    fn default() -> Self {
        Self {
            data: None,
            data_updated_at: None,
            error: None,
            error_updated_at: None,
            error_update_count: 0,
            failure_count: 0,
            failure_reason: None,
            is_error: false,
            is_fetched: false,
            is_fetched_after_mount: false,
            is_fetching: false,
            is_loading: false,
            is_loading_error: false,
            is_paused: false,
            is_pending: true,
            is_placeholder_data: false,
            is_refetch_error: false,
            is_refetching: false,
            is_stale: true,
            is_success: false,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
        }
    }
}

macro_rules! changed_props {
    ($prev:expr, $next:expr, $($field:ident => $prop:ident),* $(,)?) => {{
        let mut changed = Vec::new();
        $(if $prev.$field != $next.$field {
            changed.push(ResultProp::$prop);
        })*
        changed
    }};
}

impl<S: PartialEq> QueryObserverResult<S> {
    /// Properties whose values differ between `self` and `next`.
    pub fn changed_props(&self, next: &Self) -> Vec<ResultProp> {
        changed_props!(self, next,
            data => Data,
            data_updated_at => DataUpdatedAt,
            error => Error,
            error_updated_at => ErrorUpdatedAt,
            error_update_count => ErrorUpdateCount,
            failure_count => FailureCount,
            failure_reason => FailureReason,
            is_error => IsError,
            is_fetched => IsFetched,
            is_fetched_after_mount => IsFetchedAfterMount,
            is_fetching => IsFetching,
            is_loading => IsLoading,
            is_loading_error => IsLoadingError,
            is_paused => IsPaused,
            is_pending => IsPending,
            is_placeholder_data => IsPlaceholderData,
            is_refetch_error => IsRefetchError,
            is_refetching => IsRefetching,
            is_stale => IsStale,
            is_success => IsSuccess,
            status => Status,
            fetch_status => FetchStatus,
        )
    }
}

/// A result that records which properties are read.
///
/// Observers using tracked change notification only notify when a property read
/// through one of these accessors changed.
#[derive(Debug, Clone)]
pub struct TrackedQueryResult<S> {
    result: QueryObserverResult<S>,
    tracked: Rc<RefCell<HashSet<ResultProp>>>,
}

macro_rules! tracked_copy {
    ($($(#[$doc:meta])* $field:ident: $ty:ty => $prop:ident),* $(,)?) => {
        $($(#[$doc])*
        pub fn $field(&self) -> $ty {
            self.track(ResultProp::$prop);
            self.result.$field
        })*
    };
}

impl<S> TrackedQueryResult<S> {
    pub(crate) fn new(result: QueryObserverResult<S>, tracked: Rc<RefCell<HashSet<ResultProp>>>) -> Self {
        Self { result, tracked }
    }

    fn track(&self, prop: ResultProp) {
        self.tracked.borrow_mut().insert(prop);
    }

    /// Selected data, or placeholder data.
    pub fn data(&self) -> Option<&S> {
        self.track(ResultProp::Data);
        self.result.data.as_ref()
    }

    /// The query error, or the error of the `select` function.
    pub fn error(&self) -> Option<&FetchError> {
        self.track(ResultProp::Error);
        self.result.error.as_ref()
    }

    /// Error of the last failed attempt.
    pub fn failure_reason(&self) -> Option<&FetchError> {
        self.track(ResultProp::FailureReason);
        self.result.failure_reason.as_ref()
    }

    tracked_copy! {
        /// When the cached data was last updated.
        data_updated_at: Option<Instant> => DataUpdatedAt,
        /// When the error was last set.
        error_updated_at: Option<Instant> => ErrorUpdatedAt,
        /// Number of errors of the query.
        error_update_count: u32 => ErrorUpdateCount,
        /// Failed attempts of the current or last fetch.
        failure_count: u32 => FailureCount,
        /// `status == Error`.
        is_error: bool => IsError,
        /// The query has fetched at least once.
        is_fetched: bool => IsFetched,
        /// The query has fetched since this observer mounted.
        is_fetched_after_mount: bool => IsFetchedAfterMount,
        /// A fetch is in flight.
        is_fetching: bool => IsFetching,
        /// First fetch in flight.
        is_loading: bool => IsLoading,
        /// The first fetch failed.
        is_loading_error: bool => IsLoadingError,
        /// A fetch waits for connectivity.
        is_paused: bool => IsPaused,
        /// No data yet.
        is_pending: bool => IsPending,
        /// `data` is placeholder data.
        is_placeholder_data: bool => IsPlaceholderData,
        /// A refetch failed while data is cached.
        is_refetch_error: bool => IsRefetchError,
        /// Background refetch in flight.
        is_refetching: bool => IsRefetching,
        /// The data is stale.
        is_stale: bool => IsStale,
        /// `status == Success`.
        is_success: bool => IsSuccess,
        /// Data status.
        status: QueryStatus => Status,
        /// Fetch status.
        fetch_status: FetchStatus => FetchStatus,
    }

    /// The untracked result.
    pub fn into_inner(self) -> QueryObserverResult<S> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_props_lists_differences() {
        let prev = QueryObserverResult::<u32>::default();
        let next = QueryObserverResult {
            data: Some(1),
            is_pending: false,
            ..QueryObserverResult::default()
        };
        assert_eq!(prev.changed_props(&next), vec![ResultProp::Data, ResultProp::IsPending]);
        assert!(next.changed_props(&next.clone()).is_empty());
    }

    #[test]
    fn accessors_record_reads() {
        let tracked = Rc::new(RefCell::new(HashSet::new()));
        let result = TrackedQueryResult::new(QueryObserverResult::<u32>::default(), tracked.clone());
        let _ = result.data();
        let _ = result.is_fetching();
        let _ = result.is_fetching();

        let tracked = tracked.borrow();
        assert_eq!(tracked.len(), 2);
        assert!(tracked.contains(&ResultProp::Data));
        assert!(tracked.contains(&ResultProp::IsFetching));
    }
}
