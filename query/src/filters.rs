use std::{fmt, rc::Rc};

use crate::{
    hash_key,
    mutation::{AnyMutation, MutationStatus},
    partial_match_key,
    query::AnyQuery,
    query_state::FetchStatus,
    QueryKey,
};

/// Which queries a filter selects by observer activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryTypeFilter {
    /// Every query.
    #[default]
    All,
    /// Queries with at least one enabled observer.
    Active,
    /// Queries without enabled observers.
    Inactive,
}

/// Selects queries for bulk operations.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Key prefix, or exact key with `exact`.
    pub query_key: Option<QueryKey>,
    /// Match `query_key` exactly instead of as a prefix.
    pub exact: bool,
    /// Activity filter.
    pub kind: QueryTypeFilter,
    /// Match only stale (`true`) or fresh (`false`) queries.
    pub stale: Option<bool>,
    /// Match only this fetch status.
    pub fetch_status: Option<FetchStatus>,
    /// Custom predicate.
    pub predicate: Option<Rc<dyn Fn(&dyn AnyQuery) -> bool>>,
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("kind", &self.kind)
            .field("stale", &self.stale)
            .field("fetch_status", &self.fetch_status)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}

impl QueryFilters {
    /// Matches every query whose key starts with `query_key`.
    pub fn key(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(query_key.into()),
            ..Self::default()
        }
    }

    /// Matches the query with exactly `query_key`.
    pub fn exact(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(query_key.into()),
            exact: true,
            ..Self::default()
        }
    }

    /// Restrict by activity.
    pub fn set_kind(self, kind: QueryTypeFilter) -> Self {
        Self { kind, ..self }
    }

    /// Restrict by staleness.
    pub fn set_stale(self, stale: bool) -> Self {
        Self {
            stale: Some(stale),
            ..self
        }
    }

    /// Restrict by fetch status.
    pub fn set_fetch_status(self, fetch_status: FetchStatus) -> Self {
        Self {
            fetch_status: Some(fetch_status),
            ..self
        }
    }

    /// Restrict with a predicate.
    pub fn set_predicate(self, predicate: impl Fn(&dyn AnyQuery) -> bool + 'static) -> Self {
        Self {
            predicate: Some(Rc::new(predicate)),
            ..self
        }
    }

    /// Whether `query` passes every set criterion.
    pub fn matches(&self, query: &dyn AnyQuery) -> bool {
        if let Some(query_key) = &self.query_key {
            if self.exact {
                if query.query_hash() != hash_key(query_key) {
                    return false;
                }
            } else if !partial_match_key(query.query_key(), query_key) {
                return false;
            }
        }

        match self.kind {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active if !query.is_active() => return false,
            QueryTypeFilter::Inactive if query.is_active() => return false,
            _ => {}
        }

        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }

        if let Some(fetch_status) = self.fetch_status {
            if query.fetch_status() != fetch_status {
                return false;
            }
        }

        self.predicate
            .as_ref()
            .map_or(true, |predicate| predicate(query))
    }
}

/// Selects mutations.
#[derive(Clone, Default)]
pub struct MutationFilters {
    /// Key prefix, or exact key with `exact`.
    pub mutation_key: Option<QueryKey>,
    /// Match `mutation_key` exactly instead of as a prefix.
    pub exact: bool,
    /// Match only this status.
    pub status: Option<MutationStatus>,
    /// Custom predicate.
    pub predicate: Option<Rc<dyn Fn(&dyn AnyMutation) -> bool>>,
}

impl fmt::Debug for MutationFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationFilters")
            .field("mutation_key", &self.mutation_key)
            .field("exact", &self.exact)
            .field("status", &self.status)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}

impl MutationFilters {
    /// Matches every mutation whose key starts with `mutation_key`.
    pub fn key(mutation_key: impl Into<QueryKey>) -> Self {
        Self {
            mutation_key: Some(mutation_key.into()),
            ..Self::default()
        }
    }

    /// Restrict by status.
    pub fn set_status(self, status: MutationStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    /// Whether `mutation` passes every set criterion.
    pub fn matches(&self, mutation: &dyn AnyMutation) -> bool {
        if let Some(filter_key) = &self.mutation_key {
            let Some(mutation_key) = mutation.mutation_key() else {
                return false;
            };
            let matched = if self.exact {
                hash_key(&mutation_key) == hash_key(filter_key)
            } else {
                partial_match_key(&mutation_key, filter_key)
            };
            if !matched {
                return false;
            }
        }

        if let Some(status) = self.status {
            if mutation.status() != status {
                return false;
            }
        }

        self.predicate
            .as_ref()
            .map_or(true, |predicate| predicate(mutation))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{test_util::run_local, QueryClient, QueryObserver, QueryOptions};

    fn todo_key(id: u32) -> QueryKey {
        QueryKey::from(vec![json!("todos"), json!({ "id": id })])
    }

    #[tokio::test(start_paused = true)]
    async fn key_prefix_and_exact() {
        run_local(async {
            let client = QueryClient::default();
            client.set_query_data(todo_key(1), 1_u32).unwrap();
            client.set_query_data(todo_key(2), 2_u32).unwrap();
            client.set_query_data("todos", 0_u32).unwrap();
            let cache = client.query_cache();

            assert_eq!(cache.find_all(&QueryFilters::key("todos")).len(), 3);
            assert_eq!(cache.find_all(&QueryFilters::exact("todos")).len(), 1);
            assert_eq!(cache.find_all(&QueryFilters::exact(todo_key(2))).len(), 1);
            assert_eq!(cache.find_all(&QueryFilters::key("users")).len(), 0);

            let odd = QueryFilters::key("todos").set_predicate(|query| query.query_key() == &todo_key(1));
            assert_eq!(cache.find_all(&odd).len(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn activity_and_fetch_status() {
        run_local(async {
            let client = QueryClient::default();
            client.set_query_data("idle", 1_u32).unwrap();
            let options = QueryOptions::<u32>::new("watched").set_query_fn(|_| async {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                Ok(1)
            });
            let observer = QueryObserver::new(&client, options).unwrap();
            let _key = observer.subscribe(|_| {});
            let cache = client.query_cache();

            let active = QueryFilters::default().set_kind(QueryTypeFilter::Active);
            let inactive = QueryFilters::default().set_kind(QueryTypeFilter::Inactive);
            assert_eq!(cache.find(&active).map(|query| query.query_hash().to_string()), Some(hash_key(&"watched".into())));
            assert_eq!(cache.find(&inactive).map(|query| query.query_hash().to_string()), Some(hash_key(&"idle".into())));

            let fetching = QueryFilters::default().set_fetch_status(FetchStatus::Fetching);
            assert_eq!(cache.find_all(&fetching).len(), 1);
            tokio::time::sleep(std::time::Duration::from_millis(12)).await;
            assert!(cache.find_all(&fetching).is_empty());
            // Without observers only missing or invalidated data counts as stale.
            let stale = cache.find_all(&QueryFilters::default().set_stale(true));
            assert_eq!(stale.len(), 1);
            assert_eq!(stale[0].query_hash(), hash_key(&"watched".into()));
        })
        .await;
    }

    #[test]
    fn mutation_filter_requires_a_key_when_filtering_by_key() {
        let filters = MutationFilters::key("todos").set_status(MutationStatus::Pending);
        assert_eq!(filters.mutation_key, Some(QueryKey::from("todos")));
        assert!(!filters.exact);
    }
}
