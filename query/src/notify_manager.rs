use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

/// A deferred notification.
pub type NotifyCallback = Box<dyn FnOnce()>;

type NotifyFn = Rc<dyn Fn(NotifyCallback)>;
type ScheduleFn = Rc<dyn Fn(NotifyCallback)>;

/// Coalesces notifications raised while a batch is open into one flush.
///
/// Outside of a batch, notifications are handed straight to the scheduler, which by
/// default runs them synchronously. Every client owns its own manager.
#[derive(Clone)]
pub struct NotifyManager {
    inner: Rc<NotifyInner>,
}

struct NotifyInner {
    queue: RefCell<Vec<NotifyCallback>>,
    transactions: Cell<usize>,
    notify_fn: RefCell<NotifyFn>,
    batch_notify_fn: RefCell<ScheduleFn>,
    schedule_fn: RefCell<ScheduleFn>,
}

impl Default for NotifyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotifyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyManager")
            .field("transactions", &self.inner.transactions.get())
            .field("queued", &self.inner.queue.borrow().len())
            .finish()
    }
}

impl NotifyManager {
    /// Creates a manager that delivers synchronously.
    pub fn new() -> Self {
        let run: Rc<dyn Fn(NotifyCallback)> = Rc::new(|callback: NotifyCallback| callback());
        Self {
            inner: Rc::new(NotifyInner {
                queue: RefCell::new(Vec::new()),
                transactions: Cell::new(0),
                notify_fn: RefCell::new(run.clone()),
                batch_notify_fn: RefCell::new(run.clone()),
                schedule_fn: RefCell::new(run),
            }),
        }
    }

    /// Runs `func` as one batch. Notifications scheduled inside it are flushed once,
    /// after the outermost batch ends.
    pub fn batch<R>(&self, func: impl FnOnce() -> R) -> R {
        self.inner.transactions.set(self.inner.transactions.get() + 1);
        let guard = BatchGuard(self);
        let result = func();
        drop(guard);
        result
    }

    /// Queues `callback` when a batch is open, otherwise schedules it right away.
    pub fn schedule(&self, callback: impl FnOnce() + 'static) {
        if self.inner.transactions.get() > 0 {
            self.inner.queue.borrow_mut().push(Box::new(callback));
        } else {
            let notify = self.inner.notify_fn.borrow().clone();
            let schedule = self.inner.schedule_fn.borrow().clone();
            schedule(Box::new(move || notify(Box::new(callback))));
        }
    }

    /// Wraps `func` so every call goes through [`schedule`](Self::schedule).
    pub fn batch_calls<A: 'static>(&self, func: impl Fn(A) + 'static) -> impl Fn(A) {
        let manager = self.clone();
        let func = Rc::new(func);
        move |args: A| {
            let func = func.clone();
            manager.schedule(move || func(args));
        }
    }

    /// Whether a batch is currently open.
    pub fn is_batching(&self) -> bool {
        self.inner.transactions.get() > 0
    }

    /// Replaces the function used to run every individual notification.
    /// Useful to wrap delivery in a framework's own update scope.
    pub fn set_notify_function(&self, func: impl Fn(NotifyCallback) + 'static) {
        *self.inner.notify_fn.borrow_mut() = Rc::new(func);
    }

    /// Replaces the function wrapping a whole flush of queued notifications.
    pub fn set_batch_notify_function(&self, func: impl Fn(NotifyCallback) + 'static) {
        *self.inner.batch_notify_fn.borrow_mut() = Rc::new(func);
    }

    /// Replaces the scheduler that decides when notifications run.
    pub fn set_scheduler(&self, func: impl Fn(NotifyCallback) + 'static) {
        *self.inner.schedule_fn.borrow_mut() = Rc::new(func);
    }

    /// Defers delivery to a freshly spawned local task instead of running inline.
    ///
    /// Requires a [`tokio::task::LocalSet`].
    pub fn defer_to_task(&self) {
        self.set_scheduler(|callback| {
            tokio::task::spawn_local(async move { callback() });
        });
    }

    fn flush(&self) {
        let queue = std::mem::take(&mut *self.inner.queue.borrow_mut());
        if queue.is_empty() {
            return;
        }
        tracing::trace!(count = queue.len(), "flushing notifications");
        let manager = self.clone();
        let schedule = self.inner.schedule_fn.borrow().clone();
        schedule(Box::new(move || {
            let batch_notify = manager.inner.batch_notify_fn.borrow().clone();
            let notify = manager.inner.notify_fn.borrow().clone();
            let inner_manager = manager.clone();
            batch_notify(Box::new(move || {
                // Notifications raised by listeners coalesce into the next flush.
                inner_manager.batch(|| {
                    for callback in queue {
                        notify(callback);
                    }
                })
            }));
        }));
    }
}

struct BatchGuard<'a>(&'a NotifyManager);

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let transactions = self.0.inner.transactions.get() - 1;
        self.0.inner.transactions.set(transactions);
        if transactions == 0 && !std::thread::panicking() {
            self.0.flush();
        }
    }
}
