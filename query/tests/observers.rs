mod common;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use common::{advance, counting, recorder, run_local};
use query_sync::{
    hash_key, FetchError, NotifyOnChangeProps, ObserverOptions, PlaceholderData, QueriesObserver, QueryClient,
    QueryError, QueryKey, QueryObserver, QueryObserverResult, QueryOptions, QueryStatus, RefetchInterval,
    ResultProp, StaleTime,
};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn disabled_observer_does_not_fetch() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let observer = QueryObserver::new(&client, counting("disabled", &calls).set_enabled(false)).unwrap();
        let _key = observer.subscribe(|_| {});
        advance(10).await;
        assert_eq!(calls.get(), 0);
        assert!(observer.get_current_result().is_pending);
        assert!(!observer.get_current_result().is_fetching);

        let result = observer.refetch().await;
        assert_eq!(calls.get(), 1);
        assert_eq!(result.data, Some(1));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn select_transforms_and_errors_stay_local() {
    run_local(async {
        let client = QueryClient::default();
        let query = || QueryOptions::<Vec<u32>>::new("numbers").set_query_fn(|_| async { Ok(vec![1, 2, 3]) });

        let sum = QueryObserver::new(
            &client,
            ObserverOptions::with_select(query(), |numbers: &Vec<u32>| Ok(numbers.iter().sum::<u32>())),
        )
        .unwrap();
        let broken = QueryObserver::new(
            &client,
            ObserverOptions::with_select(query(), |_: &Vec<u32>| Err::<u32, _>(FetchError::msg("bad select"))),
        )
        .unwrap();
        let _a = sum.subscribe(|_| {});
        let _b = broken.subscribe(|_| {});
        advance(1).await;

        assert_eq!(sum.get_current_result().data, Some(6));
        let failed = broken.get_current_result();
        assert_eq!(failed.status, QueryStatus::Error);
        assert_eq!(failed.error.map(|error| error.to_string()), Some("bad select".to_string()));

        let state = client.get_query_state::<Vec<u32>>(&"numbers".into()).unwrap();
        assert_eq!(state.status, QueryStatus::Success);
        assert!(state.error.is_none());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn placeholder_data_is_shown_but_never_cached() {
    run_local(async {
        let client = QueryClient::default();
        let options = QueryOptions::<u32>::new("placeholder")
            .set_placeholder_data(PlaceholderData::Value(42))
            .set_query_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(1)
            });
        let observer = QueryObserver::new(&client, options).unwrap();
        let _key = observer.subscribe(|_| {});

        let loading = observer.get_current_result();
        assert_eq!(loading.data, Some(42));
        assert!(loading.is_placeholder_data);
        assert_eq!(loading.status, QueryStatus::Success);
        assert_eq!(client.get_query_data::<u32>(&"placeholder".into()), None);

        advance(11).await;
        let loaded = observer.get_current_result();
        assert_eq!(loaded.data, Some(1));
        assert!(!loaded.is_placeholder_data);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn keep_previous_data_across_key_change() {
    run_local(async {
        let client = QueryClient::default();
        let page = |n: u32| {
            QueryOptions::<u32>::new(QueryKey::from(vec![json!("page"), json!(n)]))
                .set_placeholder_data(PlaceholderData::keep_previous_data())
                .set_query_fn(move |_| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(n * 10)
                })
        };
        let observer = QueryObserver::new(&client, page(1)).unwrap();
        let _key = observer.subscribe(|_| {});
        advance(11).await;
        assert_eq!(observer.get_current_result().data, Some(10));

        observer.set_options(page(2)).unwrap();
        let switching = observer.get_current_result();
        assert_eq!(switching.data, Some(10));
        assert!(switching.is_placeholder_data);
        assert!(switching.is_fetching);

        advance(11).await;
        let switched = observer.get_current_result();
        assert_eq!(switched.data, Some(20));
        assert!(!switched.is_placeholder_data);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn tracked_props_limit_notifications() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let observer = QueryObserver::new(&client, counting("tracked", &calls)).unwrap();
        let (results, listener) = recorder::<u32>();
        let _key = observer.subscribe(listener);
        advance(1).await;

        let tracked = observer.tracked_result();
        assert_eq!(tracked.data(), Some(&1));
        let before = results.borrow().len();

        // Only `is_stale` changes once stale time passes, which is not tracked.
        advance(5).await;
        assert!(observer.get_current_result().is_stale);
        assert_eq!(results.borrow().len(), before);

        observer.refetch().await;
        assert_eq!(observer.get_current_result().data, Some(2));
        assert!(results.borrow().len() > before);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn explicit_props_limit_notifications() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let options = counting("props", &calls)
            .set_notify_on_change_props(NotifyOnChangeProps::Props(vec![ResultProp::Data]));
        let observer = QueryObserver::new(&client, options).unwrap();
        let (results, listener) = recorder::<u32>();
        let _key = observer.subscribe(listener);
        advance(1).await;
        let data_changes = results.borrow().iter().filter(|result| result.data.is_some()).count();
        assert_eq!(data_changes, 1);
        let before = results.borrow().len();

        advance(5).await;
        assert_eq!(results.borrow().len(), before);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn refetch_interval_polls_while_observed() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let options = counting("poll", &calls).set_refetch_interval(RefetchInterval::Every(Duration::from_millis(100)));
        let observer = QueryObserver::new(&client, options).unwrap();
        let key = observer.subscribe(|_| {});
        advance(1).await;
        assert_eq!(calls.get(), 1);

        advance(300).await;
        assert_eq!(calls.get(), 4);

        observer.unsubscribe(key);
        advance(300).await;
        assert_eq!(calls.get(), 4);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn refetch_on_window_focus_when_stale() {
    run_local(async {
        let client = QueryClient::default();
        client.mount();
        let calls = Rc::new(Cell::new(0));
        let observer = QueryObserver::new(&client, counting("focus", &calls)).unwrap();
        let _key = observer.subscribe(|_| {});
        advance(1).await;
        assert_eq!(calls.get(), 1);

        client.environment().focus.set_focused(false);
        client.environment().focus.set_focused(true);
        advance(1).await;
        assert_eq!(calls.get(), 2);

        let fresh = QueryObserver::new(&client, counting("fresh", &calls).set_stale_time(StaleTime::Infinite)).unwrap();
        let _fresh_key = fresh.subscribe(|_| {});
        advance(1).await;
        assert_eq!(calls.get(), 3);
        client.environment().focus.set_focused(false);
        client.environment().focus.set_focused(true);
        advance(1).await;
        assert_eq!(calls.get(), 4);
        assert_eq!(fresh.get_current_result().data, Some(3));
        client.unmount();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn queries_observer_combines_once_per_batch() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let queries = vec![counting("a", &calls).into(), counting("b", &calls).into()];
        let observer = QueriesObserver::with_combine(&client, queries, |results: &[QueryObserverResult<u32>]| {
            results.iter().filter_map(|result| result.data).sum::<u32>()
        })
        .unwrap();
        let sums = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = sums.clone();
        let _key = observer.subscribe(move |sum: &u32| sink.borrow_mut().push(*sum));
        advance(1).await;
        assert_eq!(calls.get(), 2);
        assert_eq!(observer.get_current_result(), 3);
        assert_eq!(sums.borrow().last(), Some(&3));

        let kept = observer.get_observers()[1].get_current_query();
        observer
            .set_queries(vec![counting("b", &calls).into(), counting("c", &calls).into()])
            .unwrap();
        assert!(observer.get_observers()[0].get_current_query().ptr_eq(&kept));
        advance(1).await;
        assert_eq!(calls.get(), 3);
        assert_eq!(observer.get_results().len(), 2);
        assert_eq!(observer.get_current_result(), 2 + 3);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn set_queries_with_same_keys_notifies_once() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let fresh = |key: &str| counting(key, &calls).set_stale_time(Duration::from_secs(60));
        let observer = QueriesObserver::<u32>::new(&client, vec![fresh("a").into(), fresh("b").into()]).unwrap();
        let lengths = Rc::new(RefCell::new(Vec::new()));
        let sink = lengths.clone();
        let _key = observer.subscribe(move |results: &Vec<QueryObserverResult<u32>>| {
            sink.borrow_mut().push(results.len())
        });
        advance(1).await;
        lengths.borrow_mut().clear();

        observer
            .set_queries(vec![
                ObserverOptions::with_select(fresh("a"), |data: &u32| Ok(data * 100)),
                fresh("b").into(),
            ])
            .unwrap();
        advance(1).await;

        assert_eq!(*lengths.borrow(), vec![2]);
        let a = client.get_query_data::<u32>(&"a".into()).map(|data| data * 100);
        assert_eq!(observer.get_results()[0].data, a);
        assert_eq!(calls.get(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn failed_set_queries_keeps_current_members() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        client.set_query_data("text", "hello".to_string()).unwrap();
        let short_lived = |key: &str| counting(key, &calls).set_gc_time(Duration::from_millis(50));
        let observer = QueriesObserver::<u32>::new(&client, vec![short_lived("a").into()]).unwrap();
        let _key = observer.subscribe(|_| {});
        advance(1).await;

        let error = observer
            .set_queries(vec![short_lived("a").into(), counting("text", &calls).into()])
            .unwrap_err();
        assert!(matches!(error, QueryError::TypeMismatch { .. }));
        assert_eq!(observer.get_observers().len(), 1);
        assert_eq!(observer.get_results().len(), 1);

        observer.destroy();
        advance(100).await;
        assert!(client.query_cache().get(&hash_key(&"a".into())).is_none());
    })
    .await;
}
