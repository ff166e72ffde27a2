#![allow(dead_code)]

use std::{cell::Cell, cell::RefCell, future::Future, rc::Rc, time::Duration};

use query_sync::{FetchError, QueryObserverResult, QueryOptions};

/// Runs `future` on a `LocalSet`, where the engine spawns its background work.
pub async fn run_local<F: Future>(future: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(future).await
}

/// Lets spawned tasks and timers up to `millis` run.
pub async fn advance(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

/// Options whose query fn counts its calls and answers with the call number.
pub fn counting(key: &str, calls: &Rc<Cell<u32>>) -> QueryOptions<u32> {
    let calls = calls.clone();
    QueryOptions::new(key).set_query_fn(move |_| {
        calls.set(calls.get() + 1);
        let value = calls.get();
        async move { Ok::<_, FetchError>(value) }
    })
}

/// Collects every result a listener receives.
pub fn recorder<S: Clone + 'static>() -> (Rc<RefCell<Vec<QueryObserverResult<S>>>>, impl Fn(&QueryObserverResult<S>)) {
    let results = Rc::new(RefCell::new(Vec::new()));
    let sink = results.clone();
    (results, move |result: &QueryObserverResult<S>| sink.borrow_mut().push(result.clone()))
}
