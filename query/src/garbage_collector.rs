use std::cell::{Cell, RefCell};

use crate::{
    query_options::GcTime,
    util::{set_timeout, TimeoutHandle},
};

/// Eviction timer for one cache entry.
pub(crate) struct GarbageCollector {
    gc_time: Cell<Option<GcTime>>,
    handle: RefCell<Option<TimeoutHandle>>,
}

impl GarbageCollector {
    pub(crate) fn new(gc_time: GcTime) -> Self {
        Self {
            gc_time: Cell::new(Some(gc_time)),
            handle: RefCell::new(None),
        }
    }

    pub(crate) fn gc_time(&self) -> GcTime {
        self.gc_time.get().unwrap_or_default()
    }

    /// Keep max gc time.
    pub(crate) fn update_gc_time(&self, gc_time: GcTime) {
        match self.gc_time.get() {
            Some(current) if gc_time > current => self.gc_time.set(Some(gc_time)),
            None => self.gc_time.set(Some(gc_time)),
            _ => {}
        }
    }

    /// Arms the timer, replacing a pending one. `on_expire` decides whether to evict.
    pub(crate) fn enable_gc(&self, on_expire: impl FnOnce() + 'static) {
        self.disable_gc();
        if let GcTime::Duration(gc_time) = self.gc_time() {
            *self.handle.borrow_mut() = Some(set_timeout(on_expire, gc_time));
        }
    }

    pub(crate) fn disable_gc(&self) {
        if let Some(handle) = self.handle.borrow_mut().take() {
            handle.clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.handle.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::{rc::Rc, time::Duration};

    use super::*;

    #[test]
    fn keeps_max_gc_time() {
        let gc = GarbageCollector::new(GcTime::Duration(Duration::from_secs(5)));
        gc.update_gc_time(GcTime::Duration(Duration::from_secs(1)));
        assert_eq!(gc.gc_time(), GcTime::Duration(Duration::from_secs(5)));
        gc.update_gc_time(GcTime::Infinite);
        assert_eq!(gc.gc_time(), GcTime::Infinite);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_gc_time_unless_disabled() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let fired = Rc::new(Cell::new(0));
                let gc = GarbageCollector::new(GcTime::Duration(Duration::from_millis(50)));

                let counter = fired.clone();
                gc.enable_gc(move || counter.set(counter.get() + 1));
                assert!(gc.is_armed());
                tokio::time::sleep(Duration::from_millis(49)).await;
                assert_eq!(fired.get(), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                assert_eq!(fired.get(), 1);

                let counter = fired.clone();
                gc.enable_gc(move || counter.set(counter.get() + 1));
                gc.disable_gc();
                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(fired.get(), 1);
            })
            .await;
    }
}
