use std::{cell::Cell, rc::Rc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    cache_observer::{MutationCacheEvent, QueryCacheEvent},
    hydration::{dehydrate, hydrate, DehydrateOptions, DehydratedState},
    query_cache::CacheObserverKey,
    query_client::WeakQueryClient,
    util::spawn_local,
    FetchError, Instant, QueryClient, QueryError,
};

/// Storage for a whole client snapshot.
///
/// Implementations decide where the snapshot lives (a file, a key-value store, ...).
#[async_trait(?Send)]
pub trait Persister {
    /// Stores the snapshot, replacing any previous one.
    async fn persist_client(&self, client: PersistedClient) -> Result<(), FetchError>;
    /// Loads the stored snapshot, if any.
    async fn restore_client(&self) -> Result<Option<PersistedClient>, FetchError>;
    /// Deletes the stored snapshot.
    async fn remove_client(&self) -> Result<(), FetchError>;
}

/// A stored client snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedClient {
    /// When the snapshot was taken.
    pub timestamp: Instant,
    /// Snapshots with a different buster are discarded on restore.
    pub buster: String,
    /// The dehydrated caches.
    pub client_state: DehydratedState,
}

/// How snapshots are written and validated.
#[derive(Clone)]
pub struct PersistOptions {
    /// Version token. Bump it to invalidate every stored snapshot.
    pub buster: String,
    /// Snapshots older than this are discarded on restore.
    pub max_age: Duration,
    /// What goes into a snapshot.
    pub dehydrate_options: DehydrateOptions,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            buster: String::new(),
            max_age: Duration::from_secs(60 * 60 * 24),
            dehydrate_options: DehydrateOptions::default(),
        }
    }
}

/// What [`persist_query_client_restore`] did with the stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Nothing was stored.
    Missing,
    /// The snapshot was hydrated into the client.
    Restored,
    /// The snapshot was older than `max_age` and got removed.
    Expired,
    /// The snapshot had another buster and got removed.
    Busted,
}

/// Loads the stored snapshot into `client`, discarding it when expired or busted.
///
/// A snapshot that fails to load or hydrate is removed before the error is returned.
pub async fn persist_query_client_restore(
    client: &QueryClient,
    persister: &dyn Persister,
    options: &PersistOptions,
) -> Result<RestoreOutcome, QueryError> {
    let restored = match persister.restore_client().await {
        Ok(restored) => restored,
        Err(error) => {
            tracing::warn!(%error, "failed to restore persisted client");
            discard(persister).await;
            return Err(error.into());
        }
    };
    let Some(persisted) = restored else {
        return Ok(RestoreOutcome::Missing);
    };

    let age = Instant::now() - persisted.timestamp;
    if age > options.max_age {
        tracing::debug!(?age, "persisted client expired");
        discard(persister).await;
        return Ok(RestoreOutcome::Expired);
    }
    if persisted.buster != options.buster {
        tracing::debug!(stored = %persisted.buster, expected = %options.buster, "persisted client busted");
        discard(persister).await;
        return Ok(RestoreOutcome::Busted);
    }

    if let Err(error) = hydrate(client, persisted.client_state) {
        tracing::warn!(%error, "failed to hydrate persisted client");
        discard(persister).await;
        return Err(error);
    }
    Ok(RestoreOutcome::Restored)
}

async fn discard(persister: &dyn Persister) {
    if let Err(error) = persister.remove_client().await {
        tracing::warn!(%error, "failed to remove persisted client");
    }
}

/// Writes a snapshot of `client` to the persister.
pub async fn persist_query_client_save(
    client: &QueryClient,
    persister: &dyn Persister,
    options: &PersistOptions,
) -> Result<(), QueryError> {
    let persisted = PersistedClient {
        timestamp: Instant::now(),
        buster: options.buster.clone(),
        client_state: dehydrate(client, options.dehydrate_options.clone())?,
    };
    persister.persist_client(persisted).await?;
    Ok(())
}

/// Saves a snapshot whenever either cache changes, until the handle is dropped.
///
/// Changes made within one scheduler turn are written as a single snapshot.
pub fn persist_query_client_subscribe(
    client: &QueryClient,
    persister: Rc<dyn Persister>,
    options: PersistOptions,
) -> PersistSubscription {
    let saver = Rc::new(Saver {
        client: client.downgrade(),
        persister,
        options,
        scheduled: Cell::new(false),
    });

    let query_key = client.query_cache().subscribe({
        let saver = saver.clone();
        move |event: QueryCacheEvent| {
            if matches!(
                event,
                QueryCacheEvent::Added(_) | QueryCacheEvent::Removed(_) | QueryCacheEvent::Updated { .. }
            ) {
                saver.schedule();
            }
        }
    });
    let mutation_key = client.mutation_cache().subscribe(move |event: MutationCacheEvent| {
        if matches!(
            event,
            MutationCacheEvent::Added(_) | MutationCacheEvent::Removed(_) | MutationCacheEvent::Updated { .. }
        ) {
            saver.schedule();
        }
    });

    PersistSubscription {
        client: client.downgrade(),
        query_key,
        mutation_key,
    }
}

/// Restores the stored snapshot, then keeps saving changes.
pub async fn persist_query_client(
    client: &QueryClient,
    persister: Rc<dyn Persister>,
    options: PersistOptions,
) -> Result<(RestoreOutcome, PersistSubscription), QueryError> {
    let outcome = persist_query_client_restore(client, persister.as_ref(), &options).await?;
    Ok((outcome, persist_query_client_subscribe(client, persister, options)))
}

struct Saver {
    client: WeakQueryClient,
    persister: Rc<dyn Persister>,
    options: PersistOptions,
    scheduled: Cell<bool>,
}

impl Saver {
    fn schedule(self: &Rc<Self>) {
        if self.scheduled.replace(true) {
            return;
        }
        let saver = self.clone();
        spawn_local(async move {
            tokio::task::yield_now().await;
            saver.scheduled.set(false);
            let Some(client) = saver.client.upgrade() else {
                return;
            };
            if let Err(error) =
                persist_query_client_save(&client, saver.persister.as_ref(), &saver.options).await
            {
                tracing::warn!(%error, "failed to persist client");
            }
        });
    }
}

/// Keeps the persister subscribed to a client. Dropping it stops saving.
#[must_use = "dropping the subscription stops persisting"]
pub struct PersistSubscription {
    client: WeakQueryClient,
    query_key: CacheObserverKey,
    mutation_key: CacheObserverKey,
}

impl PersistSubscription {
    /// Stops saving snapshots.
    pub fn unsubscribe(self) {}
}

impl Drop for PersistSubscription {
    fn drop(&mut self) {
        if let Some(client) = self.client.upgrade() {
            client.query_cache().unsubscribe(self.query_key);
            client.mutation_cache().unsubscribe(self.mutation_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{query_options::StaleTime, test_util::run_local, QueryKey, QueryOptions};

    #[derive(Default)]
    struct MemoryPersister {
        stored: RefCell<Option<PersistedClient>>,
        writes: Cell<u32>,
    }

    #[async_trait(?Send)]
    impl Persister for MemoryPersister {
        async fn persist_client(&self, client: PersistedClient) -> Result<(), FetchError> {
            self.writes.set(self.writes.get() + 1);
            *self.stored.borrow_mut() = Some(client);
            Ok(())
        }

        async fn restore_client(&self) -> Result<Option<PersistedClient>, FetchError> {
            Ok(self.stored.borrow().clone())
        }

        async fn remove_client(&self) -> Result<(), FetchError> {
            self.stored.borrow_mut().take();
            Ok(())
        }
    }

    fn never_called() -> QueryOptions<u32> {
        QueryOptions::new("todos")
            .set_stale_time(StaleTime::Infinite)
            .set_query_fn(|_| async { Err(FetchError::msg("should use restored data")) })
    }

    #[tokio::test(start_paused = true)]
    async fn save_then_restore_into_new_client() {
        run_local(async {
            let persister = MemoryPersister::default();
            let options = PersistOptions::default();

            let client = QueryClient::default();
            client.set_query_data("todos", 5_u32).unwrap();
            persist_query_client_save(&client, &persister, &options).await.unwrap();

            let restored = QueryClient::default();
            let outcome = persist_query_client_restore(&restored, &persister, &options)
                .await
                .unwrap();
            assert_eq!(outcome, RestoreOutcome::Restored);
            assert_eq!(restored.fetch_query(never_called()).await.unwrap(), 5);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn busted_and_expired_snapshots_are_removed() {
        run_local(async {
            let persister = MemoryPersister::default();
            let client = QueryClient::default();
            client.set_query_data("todos", 5_u32).unwrap();
            let v1 = PersistOptions {
                buster: "v1".into(),
                ..PersistOptions::default()
            };
            persist_query_client_save(&client, &persister, &v1).await.unwrap();

            let v2 = PersistOptions {
                buster: "v2".into(),
                ..PersistOptions::default()
            };
            let outcome = persist_query_client_restore(&QueryClient::default(), &persister, &v2)
                .await
                .unwrap();
            assert_eq!(outcome, RestoreOutcome::Busted);
            assert!(persister.stored.borrow().is_none());

            persist_query_client_save(&client, &persister, &v1).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            let short = PersistOptions {
                max_age: Duration::from_secs(1),
                ..v1
            };
            let outcome = persist_query_client_restore(&QueryClient::default(), &persister, &short)
                .await
                .unwrap();
            assert_eq!(outcome, RestoreOutcome::Expired);
            assert!(persister.stored.borrow().is_none());

            let outcome = persist_query_client_restore(&QueryClient::default(), &persister, &short)
                .await
                .unwrap();
            assert_eq!(outcome, RestoreOutcome::Missing);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_coalesces_writes() {
        run_local(async {
            let persister = Rc::new(MemoryPersister::default());
            let client = QueryClient::default();
            let subscription =
                persist_query_client_subscribe(&client, persister.clone(), PersistOptions::default());

            client.set_query_data("a", 1_u32).unwrap();
            client.set_query_data("b", 2_u32).unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(persister.writes.get(), 1);
            let stored = persister.stored.borrow().clone().unwrap();
            assert_eq!(stored.client_state.queries.len(), 2);

            subscription.unsubscribe();
            client.set_query_data("c", 3_u32).unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(persister.writes.get(), 1);
            assert_eq!(client.get_query_data::<u32>(&QueryKey::from("c")), Some(3));
        })
        .await;
    }
}
