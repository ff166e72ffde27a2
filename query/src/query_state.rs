use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{query_options::StaleTime, FetchError, Instant};

/// Whether a query has data, an error, or neither yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryStatus {
    /// No data and no error yet.
    #[default]
    Pending,
    /// Data is present.
    Success,
    /// The first fetch failed and no data is cached.
    Error,
}

/// Whether the query function is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchStatus {
    /// An attempt is in flight or backing off.
    Fetching,
    /// A fetch is waiting for connectivity or focus.
    Paused,
    /// Nothing is running.
    #[default]
    Idle,
}

/// Which side of a paginated query is being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchDirection {
    /// Append a page after the last one.
    Forward,
    /// Prepend a page before the first one.
    Backward,
}

/// Extra information about the fetch in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchMeta {
    /// Set when fetching a single additional page.
    pub direction: Option<FetchDirection>,
}

/// The state of one query.
///
/// `status` and `fetch_status` are independent: a query can be `Success` and `Fetching`
/// (a background refetch) or `Pending` and `Paused` (waiting for connectivity).
#[derive(Clone, PartialEq)]
pub struct QueryState<V> {
    /// The last successfully fetched or written value.
    pub data: Option<V>,
    /// Number of times `data` was replaced.
    pub data_update_count: u32,
    /// When `data` was last replaced.
    pub data_updated_at: Option<Instant>,
    /// The last error, cleared on success.
    pub error: Option<FetchError>,
    /// Number of times a fetch ended in error.
    pub error_update_count: u32,
    /// When `error` was last set.
    pub error_updated_at: Option<Instant>,
    /// Failed attempts of the current or last fetch.
    pub fetch_failure_count: u32,
    /// Error of the last failed attempt.
    pub fetch_failure_reason: Option<FetchError>,
    /// Extra information about the fetch in flight.
    pub fetch_meta: Option<FetchMeta>,
    /// Marked stale regardless of stale time.
    pub is_invalidated: bool,
    /// Data status.
    pub status: QueryStatus,
    /// Fetch status.
    pub fetch_status: FetchStatus,
}

impl<V> Default for QueryState<V> {
    fn default() -> Self {
        Self {
            data: None,
            data_update_count: 0,
            data_updated_at: None,
            error: None,
            error_update_count: 0,
            error_updated_at: None,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            fetch_meta: None,
            is_invalidated: false,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
        }
    }
}

impl<V> std::fmt::Debug for QueryState<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryState")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("data", &self.data)
            .field("data_updated_at", &self.data_updated_at)
            .field("error", &self.error)
            .field("fetch_failure_count", &self.fetch_failure_count)
            .field("is_invalidated", &self.is_invalidated)
            .finish()
    }
}

impl<V> QueryState<V> {
    /// Initial state, seeded with `initial_data` when given.
    pub fn new(initial_data: Option<V>, initial_data_updated_at: Option<Instant>) -> Self {
        match initial_data {
            Some(data) => Self {
                data: Some(data),
                data_updated_at: Some(initial_data_updated_at.unwrap_or_else(Instant::now)),
                status: QueryStatus::Success,
                ..Self::default()
            },
            None => Self::default(),
        }
    }

    /// Whether the data is older than `stale_time`, or was invalidated.
    pub fn is_stale_by_time(&self, stale_time: StaleTime) -> bool {
        if self.data.is_none() {
            return true;
        }
        match stale_time {
            StaleTime::Static => false,
            _ if self.is_invalidated => true,
            StaleTime::Infinite => false,
            StaleTime::Duration(stale_time) => self
                .data_updated_at
                .map_or(true, |updated_at| Instant::now() > updated_at + stale_time),
        }
    }

    /// Time left until the data goes stale. `None` when it never will by time alone.
    pub(crate) fn time_until_stale(&self, stale_time: StaleTime) -> Option<Duration> {
        match stale_time {
            StaleTime::Duration(stale_time) => self
                .data_updated_at
                .map(|updated_at| crate::util::time_until_stale(updated_at, stale_time)),
            StaleTime::Infinite | StaleTime::Static => None,
        }
    }

    /// Maps the data, keeping every other field.
    pub fn map_data<R>(&self, mapper: impl FnOnce(&V) -> R) -> QueryState<R> {
        QueryState {
            data: self.data.as_ref().map(mapper),
            data_update_count: self.data_update_count,
            data_updated_at: self.data_updated_at,
            error: self.error.clone(),
            error_update_count: self.error_update_count,
            error_updated_at: self.error_updated_at,
            fetch_failure_count: self.fetch_failure_count,
            fetch_failure_reason: self.fetch_failure_reason.clone(),
            fetch_meta: self.fetch_meta,
            is_invalidated: self.is_invalidated,
            status: self.status,
            fetch_status: self.fetch_status,
        }
    }
}

/// A transition of the query state machine.
#[derive(Clone)]
pub(crate) enum Action<V> {
    /// An attempt failed and another one follows.
    Failed { failure_count: u32, error: FetchError },
    /// A fetch started.
    Fetch { meta: Option<FetchMeta>, can_fetch: bool },
    /// New data, from a fetch or written directly (`manual`).
    Success {
        data: V,
        updated_at: Option<Instant>,
        manual: bool,
    },
    /// The fetch gave up.
    Error { error: FetchError },
    /// The fetch was cancelled.
    Cancelled { revert: bool },
    Invalidate,
    Pause,
    Continue,
    /// Replace the whole state.
    SetState(QueryState<V>),
}

/// Untyped tag of an [`Action`], carried by cache events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// An attempt failed and another one follows.
    Failed,
    /// A fetch started.
    Fetch,
    /// New data.
    Success,
    /// The fetch gave up.
    Error,
    /// The fetch was cancelled.
    Cancelled,
    /// The query was invalidated.
    Invalidate,
    /// The fetch paused.
    Pause,
    /// The fetch resumed.
    Continue,
    /// The whole state was replaced.
    SetState,
}

impl<V> Action<V> {
    pub(crate) fn kind(&self) -> ActionKind {
        match self {
            Action::Failed { .. } => ActionKind::Failed,
            Action::Fetch { .. } => ActionKind::Fetch,
            Action::Success { .. } => ActionKind::Success,
            Action::Error { .. } => ActionKind::Error,
            Action::Cancelled { .. } => ActionKind::Cancelled,
            Action::Invalidate => ActionKind::Invalidate,
            Action::Pause => ActionKind::Pause,
            Action::Continue => ActionKind::Continue,
            Action::SetState(_) => ActionKind::SetState,
        }
    }
}

impl<V: Clone> QueryState<V> {
    /// Applies `action`. `revert_state` is the state captured when the current fetch started.
    pub(crate) fn reduce(&self, action: Action<V>, revert_state: Option<&QueryState<V>>) -> Self {
        let mut state = self.clone();
        match action {
            Action::Failed {
                failure_count,
                error,
            } => {
                state.fetch_failure_count = failure_count;
                state.fetch_failure_reason = Some(error);
            }
            Action::Pause => state.fetch_status = FetchStatus::Paused,
            Action::Continue => state.fetch_status = FetchStatus::Fetching,
            Action::Fetch { meta, can_fetch } => {
                state.fetch_failure_count = 0;
                state.fetch_failure_reason = None;
                state.fetch_meta = meta;
                state.fetch_status = if can_fetch {
                    FetchStatus::Fetching
                } else {
                    FetchStatus::Paused
                };
                if state.data.is_none() {
                    state.error = None;
                    state.status = QueryStatus::Pending;
                }
            }
            Action::Success {
                data,
                updated_at,
                manual,
            } => {
                state.data = Some(data);
                state.data_update_count += 1;
                state.data_updated_at = Some(updated_at.unwrap_or_else(Instant::now));
                state.error = None;
                state.is_invalidated = false;
                state.status = QueryStatus::Success;
                if !manual {
                    state.fetch_status = FetchStatus::Idle;
                    state.fetch_failure_count = 0;
                    state.fetch_failure_reason = None;
                }
            }
            Action::Error { error } => {
                state.error = Some(error.clone());
                state.error_update_count += 1;
                state.error_updated_at = Some(Instant::now());
                state.fetch_failure_count += 1;
                state.fetch_failure_reason = Some(error);
                state.fetch_status = FetchStatus::Idle;
                // Cached data survives a failed background refetch.
                state.status = if state.data.is_some() {
                    QueryStatus::Success
                } else {
                    QueryStatus::Error
                };
            }
            Action::Cancelled { revert } => match revert_state {
                Some(revert_state) if revert => {
                    state = QueryState {
                        fetch_status: FetchStatus::Idle,
                        ..revert_state.clone()
                    };
                }
                _ => state.fetch_status = FetchStatus::Idle,
            },
            Action::Invalidate => state.is_invalidated = true,
            Action::SetState(new_state) => state = new_state,
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch() -> Action<u32> {
        Action::Fetch {
            meta: None,
            can_fetch: true,
        }
    }

    #[test]
    fn fetch_then_success() {
        let state = QueryState::<u32>::default();
        let fetching = state.reduce(fetch(), None);
        assert_eq!(fetching.status, QueryStatus::Pending);
        assert_eq!(fetching.fetch_status, FetchStatus::Fetching);

        let done = fetching.reduce(
            Action::Success {
                data: 1,
                updated_at: None,
                manual: false,
            },
            None,
        );
        assert_eq!(done.status, QueryStatus::Success);
        assert_eq!(done.fetch_status, FetchStatus::Idle);
        assert_eq!(done.data, Some(1));
        assert_eq!(done.data_update_count, 1);
        assert!(done.data_updated_at.is_some());
    }

    #[test]
    fn fetch_while_offline_is_paused() {
        let state = QueryState::<u32>::default().reduce(
            Action::Fetch {
                meta: None,
                can_fetch: false,
            },
            None,
        );
        assert_eq!(state.fetch_status, FetchStatus::Paused);
    }

    #[test]
    fn error_without_data() {
        let state = QueryState::<u32>::default()
            .reduce(fetch(), None)
            .reduce(
                Action::Failed {
                    failure_count: 1,
                    error: FetchError::msg("a"),
                },
                None,
            )
            .reduce(
                Action::Error {
                    error: FetchError::msg("b"),
                },
                None,
            );
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.fetch_status, FetchStatus::Idle);
        assert_eq!(state.fetch_failure_count, 2);
        assert_eq!(state.error.map(|e| e.to_string()), Some("b".to_string()));
    }

    #[test]
    fn background_error_keeps_data() {
        let state = QueryState::new(Some(5u32), None)
            .reduce(fetch(), None)
            .reduce(
                Action::Error {
                    error: FetchError::msg("b"),
                },
                None,
            );
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(5));
        assert!(state.error.is_some());
    }

    #[test]
    fn fetch_after_error_without_data_goes_pending() {
        let errored = QueryState::<u32>::default().reduce(
            Action::Error {
                error: FetchError::msg("b"),
            },
            None,
        );
        let refetching = errored.reduce(fetch(), None);
        assert_eq!(refetching.status, QueryStatus::Pending);
        assert!(refetching.error.is_none());
        assert_eq!(refetching.fetch_failure_count, 0);
    }

    #[test]
    fn cancel_reverts_or_idles() {
        let before = QueryState::new(Some(1u32), None);
        let fetching = before.reduce(fetch(), None);
        let optimistic = fetching.reduce(
            Action::Success {
                data: 2,
                updated_at: None,
                manual: true,
            },
            None,
        );
        assert_eq!(optimistic.fetch_status, FetchStatus::Fetching);

        let reverted = optimistic.reduce(Action::Cancelled { revert: true }, Some(&before));
        assert_eq!(reverted.data, Some(1));
        assert_eq!(reverted.fetch_status, FetchStatus::Idle);

        let kept = optimistic.reduce(Action::Cancelled { revert: false }, Some(&before));
        assert_eq!(kept.data, Some(2));
        assert_eq!(kept.fetch_status, FetchStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness() {
        let state = QueryState::new(Some(1u32), None);
        let stale_time = StaleTime::Duration(Duration::from_millis(10));
        assert!(!state.is_stale_by_time(StaleTime::default()), "fresh at the update instant");
        assert!(!state.is_stale_by_time(stale_time));

        tokio::time::advance(Duration::from_millis(11)).await;
        assert!(state.is_stale_by_time(stale_time));
        assert!(!state.is_stale_by_time(StaleTime::Infinite));

        let invalidated = state.reduce(Action::Invalidate, None);
        assert!(invalidated.is_stale_by_time(StaleTime::Infinite));
        assert!(!invalidated.is_stale_by_time(StaleTime::Static));
        assert!(QueryState::<u32>::default().is_stale_by_time(StaleTime::Static));
    }
}
