#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About Query Sync
//!
//! Query Sync is an asynchronous cache and synchronization engine for keyed, fetchable data.
//!
//! Heavily inspired by [Tanstack Query](https://tanstack.com/query/latest/).
//!
//! You supply the fetch functions; the engine decides when to call them and what to keep.
//!
//! A Query provides:
//! - caching
//! - de-duplication
//! - invalidation
//! - background refetching
//! - refetch intervals
//! - memory management with cache lifetimes
//! - cancellation
//! - retries with backoff, paused while offline
//! - optimistic updates
//! - structural sharing of unchanged data
//! - mutations, serialized per scope
//! - dehydration, persistence and cross-client broadcast
//!
//! ## The main entry points are:
//! - [`QueryClient`] - owns the caches and runs imperative operations such as
//!   [`fetch_query`](QueryClient::fetch_query) or [`invalidate_queries`](QueryClient::invalidate_queries).
//! - [`QueryObserver`] - binds options to one query and computes a [`QueryObserverResult`] for a consumer.
//! - [`MutationObserver`] - runs mutations and tracks their state.
//!
//! # Runtime
//!
//! The engine is single threaded. Its types are `!Send` and background work is spawned
//! with [`tokio::task::spawn_local`], so everything runs inside a [`tokio::task::LocalSet`].
//!
//! # A Simple Example
//!
//! ```
//! use query_sync::{FetchError, QueryClient, QueryError, QueryOptions};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), QueryError> {
//!     let local = tokio::task::LocalSet::new();
//!     local
//!         .run_until(async {
//!             let client = QueryClient::default();
//!             let todos = QueryOptions::<Vec<String>>::new("todos")
//!                 .set_query_fn(|_| async { Ok::<_, FetchError>(vec!["write docs".to_string()]) });
//!
//!             let data = client.fetch_query(todos).await?;
//!             assert_eq!(data, vec!["write docs".to_string()]);
//!             Ok(())
//!         })
//!         .await
//! }
//! ```

pub mod broadcast;
pub mod cache_observer;
mod environment;
mod error;
mod filters;
mod garbage_collector;
pub mod hydration;
mod infinite_query;
mod instant;
mod mutation;
mod mutation_cache;
mod mutation_observer;
mod mutation_options;
mod notify_manager;
mod queries_observer;
mod query;
mod query_cache;
mod query_client;
mod query_key;
mod query_observer;
mod query_options;
pub mod query_persister;
mod query_result;
mod query_state;
mod retryer;
mod structural;
mod util;

pub use cache_observer::{CacheObserver, MutationCacheEvent, QueryCacheEvent};
pub use environment::*;
pub use error::*;
pub use filters::*;
pub use infinite_query::*;
pub use instant::*;
pub use mutation::*;
pub use mutation_cache::*;
pub use mutation_observer::*;
pub use mutation_options::*;
pub use notify_manager::*;
pub use queries_observer::*;
pub use query::{AnyQuery, FetchOptions, Query, QueryId};
pub use query_cache::*;
pub use query_client::*;
pub use query_key::*;
pub use query_observer::*;
pub use query_options::*;
pub use query_result::*;
pub use query_state::*;
pub use retryer::{CancelOptions, CancelSignal};
pub use structural::*;

/// Data a query can cache.
///
/// Serializable so queries can be dehydrated, persisted and broadcast.
pub trait QueryValue:
    Clone + PartialEq + std::fmt::Debug + StructuralShare + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}

impl<V> QueryValue for V where
    V: Clone + PartialEq + std::fmt::Debug + StructuralShare + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}

/// What an observer's `select` function may produce.
pub trait SelectedValue: Clone + PartialEq + std::fmt::Debug + StructuralShare + 'static {}

impl<S> SelectedValue for S where S: Clone + PartialEq + std::fmt::Debug + StructuralShare + 'static {}
