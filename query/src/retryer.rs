use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use futures::{
    future::{self, Either, LocalBoxFuture, Shared},
    FutureExt,
};
use futures_channel::oneshot;

use crate::{
    environment::Environment,
    query_options::{NetworkMode, Retry, RetryDelay},
    CancelledError, FetchError, QueryError,
};

/// Cancellation flag handed to query and mutation functions.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Rc<Cell<bool>>);

impl CancelSignal {
    /// Whether the operation this signal belongs to was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }

    pub(crate) fn cancel(&self) {
        self.0.set(true);
    }
}

/// Options for cancelling an in-flight fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOptions {
    /// Restore the state captured before the fetch started.
    pub revert: bool,
    /// Go idle without notifying observers or cache subscribers.
    pub silent: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }
}

impl From<CancelOptions> for CancelledError {
    fn from(options: CancelOptions) -> Self {
        CancelledError {
            revert: options.revert,
            silent: options.silent,
        }
    }
}

/// Whether a fetch in `network_mode` may start right now.
pub(crate) fn can_fetch(network_mode: NetworkMode, env: &Environment) -> bool {
    network_mode != NetworkMode::Online || env.online.is_online()
}

type RunFn<T> = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<T, FetchError>>>;

pub(crate) struct RetryerConfig<T> {
    pub run: RunFn<T>,
    pub retry: Retry,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    pub env: Environment,
    pub signal: CancelSignal,
    pub can_run: Rc<dyn Fn() -> bool>,
    pub on_fail: Rc<dyn Fn(u32, &FetchError)>,
    pub on_pause: Rc<dyn Fn()>,
    pub on_continue: Rc<dyn Fn()>,
}

struct RetryerState {
    failure_count: Cell<u32>,
    is_retry_cancelled: Cell<bool>,
    is_resolved: Cell<bool>,
    cancel_tx: RefCell<Option<oneshot::Sender<CancelledError>>>,
    continue_tx: RefCell<Option<oneshot::Sender<()>>>,
    network_mode: NetworkMode,
    env: Environment,
    can_run: Rc<dyn Fn() -> bool>,
}

impl RetryerState {
    fn can_continue(&self) -> bool {
        self.env.focus.is_focused()
            && (self.network_mode == NetworkMode::Always || self.env.online.is_online())
            && (self.can_run)()
    }
}

/// Runs a fallible async function with retries, backoff, pausing and cancellation.
///
/// The returned future is lazy: it makes progress only while polled. Owners spawn it
/// (or await it) to drive the attempts.
pub(crate) struct Retryer<T> {
    promise: Shared<LocalBoxFuture<'static, Result<T, QueryError>>>,
    state: Rc<RetryerState>,
    signal: CancelSignal,
}

impl<T: Clone + 'static> Retryer<T> {
    pub(crate) fn new(config: RetryerConfig<T>) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel::<CancelledError>();
        let state = Rc::new(RetryerState {
            failure_count: Cell::new(0),
            is_retry_cancelled: Cell::new(false),
            is_resolved: Cell::new(false),
            cancel_tx: RefCell::new(Some(cancel_tx)),
            continue_tx: RefCell::new(None),
            network_mode: config.network_mode,
            env: config.env.clone(),
            can_run: config.can_run.clone(),
        });
        let signal = config.signal.clone();

        let attempts = run_attempts(config, state.clone()).boxed_local();
        let promise = {
            let state = state.clone();
            async move {
                let result = match future::select(attempts, cancel_rx).await {
                    Either::Left((result, _)) => result,
                    Either::Right((Ok(cancelled), _)) => Err(QueryError::Cancelled(cancelled)),
                    // Sender dropped without cancelling, which only happens once resolved.
                    Either::Right((Err(_), _)) => Err(QueryError::Cancelled(CancelledError::default())),
                };
                state.is_resolved.set(true);
                state.continue_tx.borrow_mut().take();
                result
            }
        }
        .boxed_local()
        .shared();

        Self {
            promise,
            state,
            signal,
        }
    }

    /// The shared outcome of the whole retry sequence.
    pub(crate) fn promise(&self) -> Shared<LocalBoxFuture<'static, Result<T, QueryError>>> {
        self.promise.clone()
    }

    /// Rejects the outcome with a cancellation, dropping the running attempt.
    pub(crate) fn cancel(&self, options: CancelOptions) {
        if self.state.is_resolved.get() {
            return;
        }
        self.signal.cancel();
        if let Some(cancel_tx) = self.state.cancel_tx.borrow_mut().take() {
            let _ = cancel_tx.send(options.into());
        }
    }

    /// Resumes a paused retryer if it may continue.
    pub(crate) fn continue_fetch(&self) {
        if self.state.is_resolved.get() || self.state.can_continue() {
            if let Some(continue_tx) = self.state.continue_tx.borrow_mut().take() {
                let _ = continue_tx.send(());
            }
        }
    }

    /// Stops scheduling further attempts. The current attempt may still succeed.
    pub(crate) fn cancel_retry(&self) {
        self.state.is_retry_cancelled.set(true);
    }

    /// Re-allows retries after [`Retryer::cancel_retry`].
    pub(crate) fn continue_retry(&self) {
        self.state.is_retry_cancelled.set(false);
    }

    /// Whether the sequence has settled.
    pub(crate) fn is_resolved(&self) -> bool {
        self.state.is_resolved.get()
    }

    /// Number of failed attempts that were followed by a retry.
    #[cfg(test)]
    pub(crate) fn failure_count(&self) -> u32 {
        self.state.failure_count.get()
    }
}

async fn pause(state: &RetryerState, on_pause: &dyn Fn(), on_continue: &dyn Fn()) {
    let (continue_tx, continue_rx) = oneshot::channel();
    *state.continue_tx.borrow_mut() = Some(continue_tx);
    on_pause();
    let _ = continue_rx.await;
    if !state.is_resolved.get() {
        on_continue();
    }
}

async fn run_attempts<T>(config: RetryerConfig<T>, state: Rc<RetryerState>) -> Result<T, QueryError> {
    let can_start = can_fetch(config.network_mode, &config.env) && (config.can_run)();
    if !can_start {
        pause(&state, &*config.on_pause, &*config.on_continue).await;
    }

    loop {
        let error = match (config.run)().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let failure_count = state.failure_count.get();
        let should_retry = config.retry.should_retry(failure_count, &error);
        if state.is_retry_cancelled.get() || !should_retry {
            return Err(QueryError::Fetch(error));
        }

        let delay = config.retry_delay.delay(failure_count, &error);
        state.failure_count.set(failure_count + 1);
        (config.on_fail)(failure_count + 1, &error);
        tracing::debug!(failure_count = failure_count + 1, ?delay, "attempt failed, retrying");

        tokio::time::sleep(delay).await;
        if !state.can_continue() {
            pause(&state, &*config.on_pause, &*config.on_continue).await;
        }
        if state.is_retry_cancelled.get() {
            return Err(QueryError::Fetch(error));
        }
    }
}
