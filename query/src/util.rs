use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

use crate::Instant;

/// Handle to a pending timer. Clearing (or dropping) it cancels the callback.
#[derive(Debug)]
pub(crate) struct TimeoutHandle(JoinHandle<()>);

impl TimeoutHandle {
    pub(crate) fn clear(self) {
        self.0.abort();
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `func` after `duration` on the current `LocalSet`.
pub(crate) fn set_timeout(func: impl FnOnce() + 'static, duration: Duration) -> TimeoutHandle {
    TimeoutHandle(tokio::task::spawn_local(async move {
        tokio::time::sleep(duration).await;
        func();
    }))
}

/// Runs `func` every `period` until the handle is cleared.
/// `func` returns false to stop the interval.
pub(crate) fn set_interval(func: impl Fn() -> bool + 'static, period: Duration) -> TimeoutHandle {
    TimeoutHandle(tokio::task::spawn_local(async move {
        loop {
            tokio::time::sleep(period).await;
            if !func() {
                break;
            }
        }
    }))
}

/// Drives `future` to completion in the background.
pub(crate) fn spawn_local(future: impl Future<Output = ()> + 'static) {
    drop(tokio::task::spawn_local(future));
}

/// Remaining time before data updated at `updated_at` goes stale.
pub(crate) fn time_until_stale(updated_at: Instant, stale_time: Duration) -> Duration {
    (updated_at + stale_time) - Instant::now()
}
