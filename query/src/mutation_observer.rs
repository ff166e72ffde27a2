use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use futures::future::LocalBoxFuture;
use slotmap::SlotMap;

use crate::{
    mutation::{Mutation, MutationContext, MutationListener, MutationStatus, MutationValue},
    mutation_options::MutationOptions,
    query::{next_observer_key, ObserverKey},
    query_observer::ListenerKey,
    FetchError, Instant, QueryClient, QueryError,
};

/// What a [`MutationObserver`] exposes about its latest submission.
#[derive(Debug, Clone)]
pub struct MutationObserverResult<D, Vars, Ctx> {
    /// Result of the mutation function.
    pub data: Option<D>,
    /// The error it failed with.
    pub error: Option<FetchError>,
    /// The variables it was submitted with.
    pub variables: Option<Vars>,
    /// Output of `on_mutate`.
    pub context: Option<Ctx>,
    /// Failed attempts.
    pub failure_count: u32,
    /// The last attempt's error.
    pub failure_reason: Option<FetchError>,
    /// Waiting for connectivity or its scope.
    pub is_paused: bool,
    /// Lifecycle.
    pub status: MutationStatus,
    /// When it was submitted.
    pub submitted_at: Option<Instant>,
    /// Nothing submitted yet, or reset.
    pub is_idle: bool,
    /// Running.
    pub is_pending: bool,
    /// Finished successfully.
    pub is_success: bool,
    /// Failed.
    pub is_error: bool,
}

impl<D, Vars, Ctx> Default for MutationObserverResult<D, Vars, Ctx> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            variables: None,
            context: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: false,
            status: MutationStatus::Idle,
            submitted_at: None,
            is_idle: true,
            is_pending: false,
            is_success: false,
            is_error: false,
        }
    }
}

type Listener<D, Vars, Ctx> = Rc<dyn Fn(&MutationObserverResult<D, Vars, Ctx>)>;

/// Submits mutations with fixed options and tracks the latest one.
pub struct MutationObserver<D, Vars, Ctx = ()> {
    inner: Rc<MutationObserverInner<D, Vars, Ctx>>,
}

impl<D, Vars, Ctx> Clone for MutationObserver<D, Vars, Ctx> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct MutationObserverInner<D, Vars, Ctx> {
    this: Weak<MutationObserverInner<D, Vars, Ctx>>,
    key: ObserverKey,
    client: QueryClient,
    options: RefCell<MutationOptions<D, Vars, Ctx>>,
    current: RefCell<Option<Mutation<D, Vars, Ctx>>>,
    result: RefCell<MutationObserverResult<D, Vars, Ctx>>,
    listeners: RefCell<SlotMap<ListenerKey, Listener<D, Vars, Ctx>>>,
    notify_pending: Cell<bool>,
}

impl<D: MutationValue, Vars: MutationValue, Ctx: MutationContext> MutationObserver<D, Vars, Ctx> {
    /// Creates an observer submitting with `options`.
    pub fn new(client: &QueryClient, options: MutationOptions<D, Vars, Ctx>) -> Self {
        let inner = Rc::new_cyclic(|this| MutationObserverInner {
            this: this.clone(),
            key: next_observer_key(),
            client: client.clone(),
            options: RefCell::new(options),
            current: RefCell::new(None),
            result: RefCell::new(MutationObserverResult::default()),
            listeners: RefCell::new(SlotMap::with_key()),
            notify_pending: Cell::new(false),
        });
        Self { inner }
    }

    /// Replaces the options used by later submissions.
    pub fn set_options(&self, options: MutationOptions<D, Vars, Ctx>) {
        *self.inner.options.borrow_mut() = options;
    }

    /// Registers a listener.
    pub fn subscribe(&self, listener: impl Fn(&MutationObserverResult<D, Vars, Ctx>) + 'static) -> ListenerKey {
        self.inner.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Removes a listener. Removing the last one releases the current mutation.
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        let (removed, empty) = {
            let mut listeners = self.inner.listeners.borrow_mut();
            let removed = listeners.remove(key).is_some();
            (removed, listeners.is_empty())
        };
        if removed && empty {
            self.inner.detach();
        }
        removed
    }

    /// Submits a new mutation with `variables`, replacing the tracked one.
    pub fn mutate(&self, variables: Vars) -> LocalBoxFuture<'static, Result<D, QueryError>> {
        self.inner.detach();
        let options = self.inner.options.borrow().clone();
        let mutation = self.inner.client.build_mutation(options);
        let listener: Weak<dyn MutationListener> = self.inner.this.clone();
        mutation.add_observer(self.inner.key, listener);
        *self.inner.current.borrow_mut() = Some(mutation.clone());
        mutation.execute(variables)
    }

    /// Forgets the tracked mutation and returns to idle.
    pub fn reset(&self) {
        self.inner.detach();
        self.inner.update_result();
    }

    /// The latest result.
    pub fn get_current_result(&self) -> MutationObserverResult<D, Vars, Ctx> {
        self.inner.result.borrow().clone()
    }
}

impl<D: MutationValue, Vars: MutationValue, Ctx: MutationContext> MutationObserverInner<D, Vars, Ctx> {
    fn detach(&self) {
        if let Some(mutation) = self.current.borrow_mut().take() {
            mutation.remove_observer(self.key);
        }
    }

    fn update_result(&self) {
        let next = match self.current.borrow().as_ref() {
            Some(mutation) => {
                let state = mutation.state();
                MutationObserverResult {
                    is_idle: state.status == MutationStatus::Idle,
                    is_pending: state.status == MutationStatus::Pending,
                    is_success: state.status == MutationStatus::Success,
                    is_error: state.status == MutationStatus::Error,
                    data: state.data,
                    error: state.error,
                    variables: state.variables,
                    context: state.context,
                    failure_count: state.failure_count,
                    failure_reason: state.failure_reason,
                    is_paused: state.is_paused,
                    status: state.status,
                    submitted_at: state.submitted_at,
                }
            }
            None => MutationObserverResult::default(),
        };
        *self.result.borrow_mut() = next;
        self.notify();
    }

    fn notify(&self) {
        if self.listeners.borrow().is_empty() || self.notify_pending.replace(true) {
            return;
        }
        let this = self.this.clone();
        self.client.environment().notify.schedule(move || {
            if let Some(inner) = this.upgrade() {
                inner.notify_pending.set(false);
                let result = inner.result.borrow().clone();
                let listeners: Vec<_> = inner.listeners.borrow().values().cloned().collect();
                for listener in listeners {
                    listener(&result);
                }
            }
        });
    }
}

impl<D: MutationValue, Vars: MutationValue, Ctx: MutationContext> MutationListener
    for MutationObserverInner<D, Vars, Ctx>
{
    fn on_mutation_update(&self) {
        self.update_result();
    }
}
