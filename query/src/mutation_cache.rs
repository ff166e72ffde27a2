use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use futures::future;
use slotmap::SlotMap;

use crate::{
    cache_observer::{CacheObserver, MutationCacheEvent},
    environment::Environment,
    filters::MutationFilters,
    mutation::{AnyMutation, Mutation, MutationContext, MutationStatus, MutationValue},
    mutation_options::{DefaultMutationOptions, MutationOptions},
    query_cache::CacheObserverKey,
    FetchError,
};

/// Callbacks run for every mutation in a cache, before the mutation's own callbacks.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
    /// A mutation was submitted.
    pub on_mutate: Option<Rc<dyn Fn(&dyn AnyMutation)>>,
    /// A mutation failed for good.
    pub on_error: Option<Rc<dyn Fn(&FetchError, &dyn AnyMutation)>>,
    /// A mutation succeeded.
    pub on_success: Option<Rc<dyn Fn(&dyn AnyMutation)>>,
    /// A mutation succeeded or failed for good.
    pub on_settled: Option<Rc<dyn Fn(Option<&FetchError>, &dyn AnyMutation)>>,
}

/// Registry of mutations in submission order.
///
/// Mutations sharing a scope id run one at a time: a submission waits (paused) until
/// every earlier pending mutation of its scope settled.
#[derive(Clone)]
pub struct MutationCache {
    inner: Rc<MutationCacheInner>,
}

struct MutationCacheInner {
    mutations: RefCell<Vec<Rc<dyn AnyMutation>>>,
    observers: RefCell<SlotMap<CacheObserverKey, Rc<dyn CacheObserver<MutationCacheEvent>>>>,
    config: MutationCacheConfig,
    env: Environment,
}

/// Non-owning handle held by mutations.
#[derive(Clone)]
pub(crate) struct WeakMutationCache(Weak<MutationCacheInner>);

impl WeakMutationCache {
    pub(crate) fn upgrade(&self) -> Option<MutationCache> {
        self.0.upgrade().map(|inner| MutationCache { inner })
    }
}

impl Default for MutationCache {
    fn default() -> Self {
        Self::new(MutationCacheConfig::default(), Environment::default())
    }
}

impl std::fmt::Debug for MutationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCache")
            .field("mutations", &self.inner.mutations.borrow().len())
            .finish()
    }
}

fn scope_of(mutation: &dyn AnyMutation) -> String {
    mutation
        .scope_id()
        .unwrap_or_else(|| format!("#{:?}", mutation.mutation_id()))
}

impl MutationCache {
    /// Creates an empty cache.
    pub fn new(config: MutationCacheConfig, env: Environment) -> Self {
        Self {
            inner: Rc::new(MutationCacheInner {
                mutations: RefCell::new(Vec::new()),
                observers: RefCell::new(SlotMap::with_key()),
                config,
                env,
            }),
        }
    }

    fn downgrade(&self) -> WeakMutationCache {
        WeakMutationCache(Rc::downgrade(&self.inner))
    }

    /// Creates and registers a new mutation. Every call creates a fresh one.
    pub fn build<D, Vars, Ctx>(
        &self,
        options: MutationOptions<D, Vars, Ctx>,
        config: DefaultMutationOptions,
    ) -> Mutation<D, Vars, Ctx>
    where
        D: MutationValue,
        Vars: MutationValue,
        Ctx: MutationContext,
    {
        let mutation = Mutation::new(options, config, self.downgrade(), self.inner.env.clone());
        let erased = mutation.erased();
        self.inner.mutations.borrow_mut().push(erased.clone());
        self.notify(MutationCacheEvent::Added(erased));
        mutation
    }

    /// Unregisters `mutation`.
    pub fn remove(&self, mutation: &dyn AnyMutation) {
        let removed = {
            let mut mutations = self.inner.mutations.borrow_mut();
            mutations
                .iter()
                .position(|registered| registered.mutation_id() == mutation.mutation_id())
                .map(|index| mutations.remove(index))
        };
        if let Some(removed) = removed {
            removed.destroy();
            self.notify(MutationCacheEvent::Removed(removed));
        }
    }

    /// Removes every mutation.
    pub fn clear(&self) {
        self.inner.env.notify.batch(|| {
            for mutation in self.get_all() {
                self.remove(mutation.as_ref());
            }
        });
    }

    /// Every mutation, in submission order.
    pub fn get_all(&self) -> Vec<Rc<dyn AnyMutation>> {
        self.inner.mutations.borrow().clone()
    }

    /// The first mutation matching `filters`.
    pub fn find(&self, filters: &MutationFilters) -> Option<Rc<dyn AnyMutation>> {
        self.get_all()
            .into_iter()
            .find(|mutation| filters.matches(mutation.as_ref()))
    }

    /// Every mutation matching `filters`.
    pub fn find_all(&self, filters: &MutationFilters) -> Vec<Rc<dyn AnyMutation>> {
        self.get_all()
            .into_iter()
            .filter(|mutation| filters.matches(mutation.as_ref()))
            .collect()
    }

    /// Registers a cache-level listener.
    pub fn subscribe(&self, observer: impl CacheObserver<MutationCacheEvent> + 'static) -> CacheObserverKey {
        self.inner.observers.borrow_mut().insert(Rc::new(observer))
    }

    /// Removes a cache-level listener.
    pub fn unsubscribe(&self, key: CacheObserverKey) -> bool {
        self.inner.observers.borrow_mut().remove(key).is_some()
    }

    pub(crate) fn notify(&self, event: MutationCacheEvent) {
        let observers: Vec<_> = self.inner.observers.borrow().values().cloned().collect();
        if observers.is_empty() {
            return;
        }
        self.inner.env.notify.batch(|| {
            for observer in observers {
                observer.process_cache_event(event.clone());
            }
        });
    }

    /// Whether `mutation` is the oldest pending mutation of its scope.
    pub(crate) fn can_run(&self, mutation: &dyn AnyMutation) -> bool {
        let scope = scope_of(mutation);
        self.inner
            .mutations
            .borrow()
            .iter()
            .find(|other| other.status() == MutationStatus::Pending && scope_of(other.as_ref()) == scope)
            .map_or(true, |first| first.mutation_id() == mutation.mutation_id())
    }

    /// Wakes the next paused mutation of `mutation`'s scope.
    pub(crate) fn run_next(&self, mutation: &dyn AnyMutation) {
        let scope = scope_of(mutation);
        let next = self
            .inner
            .mutations
            .borrow()
            .iter()
            .find(|other| {
                other.mutation_id() != mutation.mutation_id()
                    && other.is_paused()
                    && scope_of(other.as_ref()) == scope
            })
            .cloned();
        if let Some(next) = next {
            tracing::trace!(?scope, "running next mutation in scope");
            drop(next.resume());
        }
    }

    /// Resumes every paused mutation. Resolves once all of them settled.
    pub async fn resume_paused_mutations(&self) {
        let paused: Vec<_> = self
            .get_all()
            .into_iter()
            .filter(|mutation| mutation.is_paused())
            .collect();
        if paused.is_empty() {
            return;
        }
        tracing::debug!(count = paused.len(), "resuming paused mutations");
        let pending = self
            .inner
            .env
            .notify
            .batch(|| paused.iter().map(|mutation| mutation.resume()).collect::<Vec<_>>());
        future::join_all(pending).await;
    }

    pub(crate) fn on_mutate(&self, mutation: &dyn AnyMutation) {
        if let Some(on_mutate) = &self.inner.config.on_mutate {
            on_mutate(mutation);
        }
    }

    pub(crate) fn on_success(&self, mutation: &dyn AnyMutation) {
        if let Some(on_success) = &self.inner.config.on_success {
            on_success(mutation);
        }
    }

    pub(crate) fn on_error(&self, error: &FetchError, mutation: &dyn AnyMutation) {
        if let Some(on_error) = &self.inner.config.on_error {
            on_error(error, mutation);
        }
    }

    pub(crate) fn on_settled(&self, error: Option<&FetchError>, mutation: &dyn AnyMutation) {
        if let Some(on_settled) = &self.inner.config.on_settled {
            on_settled(error, mutation);
        }
    }
}
