use std::rc::Rc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    mutation::{AnyMutation, MutationStatus},
    query::AnyQuery,
    query_options::Meta,
    query_state::{FetchStatus, QueryState, QueryStatus},
    FetchError, Instant, QueryClient, QueryError, QueryKey,
};

/// JSON-safe snapshot of a query's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQueryState {
    /// Data as JSON.
    #[serde(default)]
    pub data: Option<Value>,
    /// Number of times data was replaced.
    #[serde(default)]
    pub data_update_count: u32,
    /// When data was last replaced.
    #[serde(default)]
    pub data_updated_at: Option<Instant>,
    /// Message of the last error.
    #[serde(default)]
    pub error: Option<String>,
    /// Number of errors.
    #[serde(default)]
    pub error_update_count: u32,
    /// When the error was last set.
    #[serde(default)]
    pub error_updated_at: Option<Instant>,
    /// Failed attempts of the last fetch.
    #[serde(default)]
    pub fetch_failure_count: u32,
    /// Message of the last failed attempt.
    #[serde(default)]
    pub fetch_failure_reason: Option<String>,
    /// Whether the query was invalidated.
    #[serde(default)]
    pub is_invalidated: bool,
    /// Data status.
    pub status: QueryStatus,
    /// Fetch status at the time of the snapshot.
    #[serde(default)]
    pub fetch_status: FetchStatus,
}

impl DehydratedQueryState {
    /// Serializes `state`.
    pub fn from_state<V: Serialize>(state: &QueryState<V>) -> Result<Self, QueryError> {
        let data = state
            .data
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(QueryError::serialization)?;
        Ok(Self {
            data,
            data_update_count: state.data_update_count,
            data_updated_at: state.data_updated_at,
            error: state.error.as_ref().map(ToString::to_string),
            error_update_count: state.error_update_count,
            error_updated_at: state.error_updated_at,
            fetch_failure_count: state.fetch_failure_count,
            fetch_failure_reason: state.fetch_failure_reason.as_ref().map(ToString::to_string),
            is_invalidated: state.is_invalidated,
            status: state.status,
            fetch_status: state.fetch_status,
        })
    }

    /// Deserializes into a typed state. Errors come back as plain messages.
    pub fn to_state<V: DeserializeOwned>(&self) -> Result<QueryState<V>, QueryError> {
        let data = self
            .data
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(QueryError::serialization)?;
        Ok(QueryState {
            data,
            data_update_count: self.data_update_count,
            data_updated_at: self.data_updated_at,
            error: self.error.as_ref().map(FetchError::msg),
            error_update_count: self.error_update_count,
            error_updated_at: self.error_updated_at,
            fetch_failure_count: self.fetch_failure_count,
            fetch_failure_reason: self.fetch_failure_reason.as_ref().map(FetchError::msg),
            fetch_meta: None,
            is_invalidated: self.is_invalidated,
            status: self.status,
            fetch_status: self.fetch_status,
        })
    }
}

/// A query in a [`DehydratedState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQuery {
    /// Canonical hash.
    pub query_hash: String,
    /// Key.
    pub query_key: QueryKey,
    /// State.
    pub state: DehydratedQueryState,
    /// Metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// JSON-safe snapshot of a mutation's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedMutationState {
    /// Result as JSON.
    #[serde(default)]
    pub data: Option<Value>,
    /// Variables as JSON.
    #[serde(default)]
    pub variables: Option<Value>,
    /// Message of the last error.
    #[serde(default)]
    pub error: Option<String>,
    /// Failed attempts.
    #[serde(default)]
    pub failure_count: u32,
    /// Whether the mutation waits for connectivity.
    #[serde(default)]
    pub is_paused: bool,
    /// Status.
    pub status: MutationStatus,
    /// When the mutation was submitted.
    #[serde(default)]
    pub submitted_at: Option<Instant>,
}

/// A mutation in a [`DehydratedState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedMutation {
    /// Key.
    #[serde(default)]
    pub mutation_key: Option<QueryKey>,
    /// State.
    pub state: DehydratedMutationState,
    /// Metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Serialized state of a whole client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState {
    /// Queries.
    #[serde(default)]
    pub queries: Vec<DehydratedQuery>,
    /// Mutations.
    #[serde(default)]
    pub mutations: Vec<DehydratedMutation>,
}

/// Chooses what [`dehydrate`] includes.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    /// Defaults to queries with status `Success`.
    pub should_dehydrate_query: Option<Rc<dyn Fn(&dyn AnyQuery) -> bool>>,
    /// Defaults to paused mutations.
    pub should_dehydrate_mutation: Option<Rc<dyn Fn(&dyn AnyMutation) -> bool>>,
}

/// Snapshots the client's caches.
///
/// Queries hydrated earlier whose value type was never built are included as they came in.
pub fn dehydrate(client: &QueryClient, options: DehydrateOptions) -> Result<DehydratedState, QueryError> {
    let should_dehydrate_query = |query: &dyn AnyQuery| match &options.should_dehydrate_query {
        Some(func) => func(query),
        None => query.status() == QueryStatus::Success,
    };
    let should_dehydrate_mutation = |mutation: &dyn AnyMutation| match &options.should_dehydrate_mutation {
        Some(func) => func(mutation),
        None => mutation.is_paused(),
    };

    let mut queries = client
        .query_cache()
        .get_all()
        .into_iter()
        .filter(|query| should_dehydrate_query(query.as_ref()))
        .map(|query| query.dehydrate())
        .collect::<Result<Vec<_>, _>>()?;
    queries.extend(client.query_cache().stashed());

    let mutations = client
        .mutation_cache()
        .get_all()
        .into_iter()
        .filter(|mutation| should_dehydrate_mutation(mutation.as_ref()))
        .map(|mutation| mutation.dehydrate())
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DehydratedState { queries, mutations })
}

/// Merges a snapshot into the client's query cache.
///
/// Existing queries are only overwritten by newer data. Queries not in the cache yet are
/// kept aside until they are first built with a concrete value type.
pub fn hydrate(client: &QueryClient, state: DehydratedState) -> Result<(), QueryError> {
    let cache = client.query_cache();
    client.environment().notify.batch(|| {
        for dehydrated in state.queries {
            match cache.get(&dehydrated.query_hash) {
                Some(query) => query.hydrate(&dehydrated.state, true)?,
                None => cache.stash(dehydrated),
            }
        }
        Ok::<_, QueryError>(())
    })?;
    if !state.mutations.is_empty() {
        tracing::debug!(
            count = state.mutations.len(),
            "skipping dehydrated mutations, mutation functions cannot be restored"
        );
    }
    Ok(())
}
