use std::{
    any::Any,
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
};

use futures::{
    future::{self, LocalBoxFuture, Shared},
    FutureExt,
};
use serde::{Deserialize, Serialize};

use crate::{
    cache_observer::MutationCacheEvent,
    environment::Environment,
    garbage_collector::GarbageCollector,
    hydration::{DehydratedMutation, DehydratedMutationState},
    mutation_cache::WeakMutationCache,
    mutation_options::{DefaultMutationOptions, MutationOptions},
    query::ObserverKey,
    query_options::Meta,
    retryer::{can_fetch, CancelSignal, Retryer, RetryerConfig},
    util::spawn_local,
    FetchError, Instant, QueryError, QueryKey,
};

/// Bounds of mutation data and variables.
pub trait MutationValue: Clone + fmt::Debug + Serialize + 'static {}

impl<T> MutationValue for T where T: Clone + fmt::Debug + Serialize + 'static {}

/// Bounds of the value produced by `on_mutate`.
pub trait MutationContext: Clone + fmt::Debug + 'static {}

impl<T> MutationContext for T where T: Clone + fmt::Debug + 'static {}

/// Lifecycle of a mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationStatus {
    /// Not submitted yet.
    #[default]
    Idle,
    /// Running, waiting for its scope, or paused.
    Pending,
    /// Finished successfully.
    Success,
    /// Failed for good.
    Error,
}

/// Identifies a mutation. Later mutations have larger ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutationId(u64);

static NEXT_MUTATION_ID: AtomicU64 = AtomicU64::new(1);

/// The state of one mutation.
#[derive(Debug, Clone)]
pub struct MutationState<D, Vars, Ctx> {
    /// Output of `on_mutate`.
    pub context: Option<Ctx>,
    /// Result of the mutation function.
    pub data: Option<D>,
    /// The error it failed with.
    pub error: Option<FetchError>,
    /// Failed attempts of the current submission.
    pub failure_count: u32,
    /// The last attempt's error.
    pub failure_reason: Option<FetchError>,
    /// Waiting for connectivity or for an earlier mutation of the same scope.
    pub is_paused: bool,
    /// Lifecycle.
    pub status: MutationStatus,
    /// The variables it was submitted with.
    pub variables: Option<Vars>,
    /// When it was submitted.
    pub submitted_at: Option<Instant>,
}

impl<D, Vars, Ctx> Default for MutationState<D, Vars, Ctx> {
    fn default() -> Self {
        Self {
            context: None,
            data: None,
            error: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: false,
            status: MutationStatus::Idle,
            variables: None,
            submitted_at: None,
        }
    }
}

/// Kinds of mutation state transitions, reported in cache events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationActionKind {
    /// An attempt failed and another one follows.
    Failed,
    /// Submitted.
    Pending,
    /// Finished successfully.
    Success,
    /// Failed for good.
    Error,
    /// Waiting for connectivity or its scope.
    Pause,
    /// Resumed.
    Continue,
}

enum MutationAction<D, Vars, Ctx> {
    Failed { failure_count: u32, error: FetchError },
    Pending { variables: Vars, context: Option<Ctx>, is_paused: bool },
    Success { data: D },
    Error { error: FetchError },
    Pause,
    Continue,
}

impl<D, Vars, Ctx> MutationAction<D, Vars, Ctx> {
    fn kind(&self) -> MutationActionKind {
        match self {
            MutationAction::Failed { .. } => MutationActionKind::Failed,
            MutationAction::Pending { .. } => MutationActionKind::Pending,
            MutationAction::Success { .. } => MutationActionKind::Success,
            MutationAction::Error { .. } => MutationActionKind::Error,
            MutationAction::Pause => MutationActionKind::Pause,
            MutationAction::Continue => MutationActionKind::Continue,
        }
    }
}

impl<D, Vars, Ctx> MutationState<D, Vars, Ctx> {
    fn reduce(self, action: MutationAction<D, Vars, Ctx>) -> Self {
        match action {
            MutationAction::Failed {
                failure_count,
                error,
            } => Self {
                failure_count,
                failure_reason: Some(error),
                ..self
            },
            MutationAction::Pause => Self {
                is_paused: true,
                ..self
            },
            MutationAction::Continue => Self {
                is_paused: false,
                ..self
            },
            MutationAction::Pending {
                variables,
                context,
                is_paused,
            } => Self {
                context,
                data: None,
                error: None,
                failure_count: 0,
                failure_reason: None,
                is_paused,
                status: MutationStatus::Pending,
                variables: Some(variables),
                submitted_at: Some(Instant::now()),
            },
            MutationAction::Success { data } => Self {
                data: Some(data),
                error: None,
                failure_count: 0,
                failure_reason: None,
                is_paused: false,
                status: MutationStatus::Success,
                ..self
            },
            MutationAction::Error { error } => Self {
                data: None,
                failure_count: self.failure_count + 1,
                failure_reason: Some(error.clone()),
                error: Some(error),
                is_paused: false,
                status: MutationStatus::Error,
                ..self
            },
        }
    }
}

/// Type-erased view of a mutation, used by the cache, filters and dehydration.
pub trait AnyMutation {
    /// Identity.
    fn mutation_id(&self) -> MutationId;
    /// Optional key.
    fn mutation_key(&self) -> Option<QueryKey>;
    /// Lifecycle.
    fn status(&self) -> MutationStatus;
    /// Waiting for connectivity or its scope.
    fn is_paused(&self) -> bool;
    /// Scope id, if set.
    fn scope_id(&self) -> Option<String>;
    /// Metadata.
    fn meta(&self) -> Option<Meta>;
    /// Failed attempts of the current submission.
    fn failure_count(&self) -> u32;
    /// When it was submitted.
    fn submitted_at(&self) -> Option<Instant>;
    /// Number of bound observers.
    fn observer_count(&self) -> usize;
    /// Snapshots the state as JSON.
    fn dehydrate(&self) -> Result<DehydratedMutation, QueryError>;
    /// Resumes a paused mutation. Resolves once it settled.
    fn resume(&self) -> LocalBoxFuture<'static, ()>;
    /// Downcasting support.
    fn as_any(&self) -> &dyn Any;
    #[doc(hidden)]
    fn destroy(&self);
}

impl fmt::Debug for dyn AnyMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("mutation_id", &self.mutation_id())
            .field("mutation_key", &self.mutation_key())
            .field("status", &self.status())
            .field("is_paused", &self.is_paused())
            .finish()
    }
}

pub(crate) trait MutationListener {
    fn on_mutation_update(&self);
}

/// Shared outcome of one submission.
pub(crate) type MutationPromise<D> = Shared<LocalBoxFuture<'static, Result<D, QueryError>>>;

/// One submission of a mutation function, with its state and callbacks.
pub struct Mutation<D, Vars, Ctx = ()> {
    inner: Rc<MutationInner<D, Vars, Ctx>>,
}

impl<D, Vars, Ctx> Clone for Mutation<D, Vars, Ctx> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: fmt::Debug, Vars: fmt::Debug, Ctx: fmt::Debug> fmt::Debug for Mutation<D, Vars, Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

struct MutationInner<D, Vars, Ctx> {
    id: MutationId,
    options: MutationOptions<D, Vars, Ctx>,
    config: DefaultMutationOptions,
    state: RefCell<MutationState<D, Vars, Ctx>>,
    observers: RefCell<Vec<(ObserverKey, Weak<dyn MutationListener>)>>,
    retryer: RefCell<Option<Retryer<D>>>,
    promise: RefCell<Option<MutationPromise<D>>>,
    gc: GarbageCollector,
    cache: WeakMutationCache,
    env: Environment,
}

impl<D: MutationValue, Vars: MutationValue, Ctx: MutationContext> Mutation<D, Vars, Ctx> {
    pub(crate) fn new(
        options: MutationOptions<D, Vars, Ctx>,
        config: DefaultMutationOptions,
        cache: WeakMutationCache,
        env: Environment,
    ) -> Self {
        let mutation = Self {
            inner: Rc::new(MutationInner {
                id: MutationId(NEXT_MUTATION_ID.fetch_add(1, Ordering::Relaxed)),
                gc: GarbageCollector::new(config.gc_time),
                options,
                config,
                state: RefCell::new(MutationState::default()),
                observers: RefCell::new(Vec::new()),
                retryer: RefCell::new(None),
                promise: RefCell::new(None),
                cache,
                env,
            }),
        };
        mutation.schedule_gc();
        mutation
    }

    pub(crate) fn erased(&self) -> Rc<dyn AnyMutation> {
        Rc::new(self.clone())
    }

    /// Identity.
    pub fn id(&self) -> MutationId {
        self.inner.id
    }

    /// Snapshot of the state.
    pub fn state(&self) -> MutationState<D, Vars, Ctx> {
        self.inner.state.borrow().clone()
    }

    /// The options it was built with.
    pub fn options(&self) -> &MutationOptions<D, Vars, Ctx> {
        &self.inner.options
    }

    fn dispatch(&self, action: MutationAction<D, Vars, Ctx>) {
        let kind = action.kind();
        {
            let mut state = self.inner.state.borrow_mut();
            let current = std::mem::take(&mut *state);
            *state = current.reduce(action);
        }
        tracing::trace!(mutation_id = self.inner.id.0, ?kind, "mutation dispatch");
        self.inner.env.notify.batch(|| {
            let observers: Vec<_> = self
                .inner
                .observers
                .borrow()
                .iter()
                .filter_map(|(_, observer)| observer.upgrade())
                .collect();
            for observer in observers {
                observer.on_mutation_update();
            }
            if let Some(cache) = self.inner.cache.upgrade() {
                cache.notify(MutationCacheEvent::Updated {
                    mutation: self.erased(),
                    action: kind,
                });
            }
        });
    }

    /// Submits the mutation. The returned future resolves once it settled; the work
    /// continues even if it is dropped.
    pub fn execute(&self, variables: Vars) -> LocalBoxFuture<'static, Result<D, QueryError>> {
        let Some(mutation_fn) = self.inner.options.mutation_fn.clone() else {
            tracing::warn!(mutation_id = self.inner.id.0, "mutation executed without a mutation function");
            return future::ready(Err(QueryError::MissingMutationFn)).boxed_local();
        };

        let weak = Rc::downgrade(&self.inner);
        let can_run: Rc<dyn Fn() -> bool> = {
            let weak = weak.clone();
            Rc::new(move || match Self::from_weak(&weak) {
                Some(mutation) => mutation
                    .inner
                    .cache
                    .upgrade()
                    .map_or(true, |cache| cache.can_run(&mutation)),
                None => true,
            })
        };
        let dispatcher = |action: fn() -> MutationAction<D, Vars, Ctx>| {
            let weak = weak.clone();
            Rc::new(move || {
                if let Some(mutation) = Self::from_weak(&weak) {
                    mutation.dispatch(action());
                }
            })
        };
        let on_fail = {
            let weak = weak.clone();
            Rc::new(move |failure_count: u32, error: &FetchError| {
                if let Some(mutation) = Self::from_weak(&weak) {
                    mutation.dispatch(MutationAction::Failed {
                        failure_count,
                        error: error.clone(),
                    });
                }
            })
        };

        let run = {
            let variables = variables.clone();
            Rc::new(move || mutation_fn(variables.clone()))
        };
        let config = &self.inner.config;
        let retryer = Retryer::new(RetryerConfig {
            run,
            retry: config.retry.clone(),
            retry_delay: config.retry_delay.clone(),
            network_mode: config.network_mode,
            env: self.inner.env.clone(),
            signal: CancelSignal::default(),
            can_run: can_run.clone(),
            on_fail,
            on_pause: dispatcher(|| MutationAction::Pause),
            on_continue: dispatcher(|| MutationAction::Continue),
        });
        let attempts = retryer.promise();
        *self.inner.retryer.borrow_mut() = Some(retryer);

        // Registers the submission in its scope before the first attempt checks it.
        let is_paused = !(can_fetch(config.network_mode, &self.inner.env) && can_run());
        self.dispatch(MutationAction::Pending {
            variables: variables.clone(),
            context: None,
            is_paused,
        });
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.on_mutate(self);
        }

        let mutation = self.clone();
        let promise = async move {
            let result = mutation.run(variables, is_paused, attempts).await;
            if let Some(cache) = mutation.inner.cache.upgrade() {
                cache.run_next(&mutation);
            }
            result
        }
        .boxed_local()
        .shared();
        *self.inner.promise.borrow_mut() = Some(promise.clone());
        spawn_local(promise.clone().map(drop));
        promise.boxed_local()
    }

    async fn run(
        &self,
        variables: Vars,
        is_paused: bool,
        attempts: MutationPromise<D>,
    ) -> Result<D, QueryError> {
        let options = &self.inner.options;
        let mut context = None;
        let result = async {
            if let Some(on_mutate) = &options.on_mutate {
                let value = on_mutate(variables.clone()).await?;
                context = Some(value.clone());
                self.dispatch(MutationAction::Pending {
                    variables: variables.clone(),
                    context: Some(value),
                    is_paused,
                });
            }
            attempts.await
        }
        .await;

        let cache = self.inner.cache.upgrade();
        match result {
            Ok(data) => {
                if let Some(cache) = &cache {
                    cache.on_success(self);
                }
                if let Some(on_success) = &options.on_success {
                    on_success(&data, &variables, context.as_ref());
                }
                if let Some(cache) = &cache {
                    cache.on_settled(None, self);
                }
                if let Some(on_settled) = &options.on_settled {
                    on_settled(Some(&data), None, &variables, context.as_ref());
                }
                self.dispatch(MutationAction::Success { data: data.clone() });
                Ok(data)
            }
            Err(error) => {
                let fetch_error = error
                    .fetch_error()
                    .cloned()
                    .unwrap_or_else(|| FetchError::msg(&error));
                tracing::debug!(mutation_id = self.inner.id.0, error = %fetch_error, "mutation failed");
                if let Some(cache) = &cache {
                    cache.on_error(&fetch_error, self);
                }
                if let Some(on_error) = &options.on_error {
                    on_error(&fetch_error, &variables, context.as_ref());
                }
                if let Some(cache) = &cache {
                    cache.on_settled(Some(&fetch_error), self);
                }
                if let Some(on_settled) = &options.on_settled {
                    on_settled(None, Some(&fetch_error), &variables, context.as_ref());
                }
                self.dispatch(MutationAction::Error { error: fetch_error });
                Err(error)
            }
        }
    }

    fn from_weak(weak: &Weak<MutationInner<D, Vars, Ctx>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn add_observer(&self, key: ObserverKey, observer: Weak<dyn MutationListener>) {
        {
            let mut observers = self.inner.observers.borrow_mut();
            if observers.iter().any(|(existing, _)| *existing == key) {
                return;
            }
            observers.push((key, observer));
        }
        self.inner.gc.disable_gc();
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.notify(MutationCacheEvent::ObserverAdded(self.erased()));
        }
    }

    pub(crate) fn remove_observer(&self, key: ObserverKey) {
        let removed = {
            let mut observers = self.inner.observers.borrow_mut();
            let before = observers.len();
            observers.retain(|(existing, _)| *existing != key);
            observers.len() != before
        };
        if !removed {
            return;
        }
        self.schedule_gc();
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.notify(MutationCacheEvent::ObserverRemoved(self.erased()));
        }
    }

    fn schedule_gc(&self) {
        let weak = Rc::downgrade(&self.inner);
        self.inner.gc.enable_gc(move || {
            if let Some(mutation) = Self::from_weak(&weak) {
                mutation.optional_remove();
            }
        });
    }

    fn optional_remove(&self) {
        if !self.inner.observers.borrow().is_empty() {
            return;
        }
        if self.inner.state.borrow().status == MutationStatus::Pending {
            self.schedule_gc();
        } else if let Some(cache) = self.inner.cache.upgrade() {
            tracing::debug!(mutation_id = self.inner.id.0, "garbage collecting mutation");
            cache.remove(self);
        }
    }
}

impl<D: MutationValue, Vars: MutationValue, Ctx: MutationContext> AnyMutation for Mutation<D, Vars, Ctx> {
    fn mutation_id(&self) -> MutationId {
        self.inner.id
    }

    fn mutation_key(&self) -> Option<QueryKey> {
        self.inner.options.mutation_key.clone()
    }

    fn status(&self) -> MutationStatus {
        self.inner.state.borrow().status
    }

    fn is_paused(&self) -> bool {
        self.inner.state.borrow().is_paused
    }

    fn scope_id(&self) -> Option<String> {
        self.inner.options.scope.clone()
    }

    fn meta(&self) -> Option<Meta> {
        self.inner.config.meta.clone()
    }

    fn failure_count(&self) -> u32 {
        self.inner.state.borrow().failure_count
    }

    fn submitted_at(&self) -> Option<Instant> {
        self.inner.state.borrow().submitted_at
    }

    fn observer_count(&self) -> usize {
        self.inner.observers.borrow().len()
    }

    fn dehydrate(&self) -> Result<DehydratedMutation, QueryError> {
        let state = self.inner.state.borrow();
        Ok(DehydratedMutation {
            mutation_key: self.mutation_key(),
            state: DehydratedMutationState {
                data: to_json(state.data.as_ref())?,
                variables: to_json(state.variables.as_ref())?,
                error: state.error.as_ref().map(ToString::to_string),
                failure_count: state.failure_count,
                is_paused: state.is_paused,
                status: state.status,
                submitted_at: state.submitted_at,
            },
            meta: self.meta(),
        })
    }

    fn resume(&self) -> LocalBoxFuture<'static, ()> {
        if let Some(retryer) = self.inner.retryer.borrow().as_ref() {
            retryer.continue_fetch();
        }
        match self.inner.promise.borrow().clone() {
            Some(promise) => promise.map(drop).boxed_local(),
            None => future::ready(()).boxed_local(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn destroy(&self) {
        self.inner.gc.disable_gc();
    }
}

fn to_json<T: Serialize>(value: Option<&T>) -> Result<Option<serde_json::Value>, QueryError> {
    value
        .map(|value| serde_json::to_value(value).map_err(QueryError::serialization))
        .transpose()
}
