mod common;

use std::{cell::Cell, rc::Rc, time::Duration};

use common::{advance, counting, recorder, run_local};
use query_sync::{
    hash_key, FetchError, FetchStatus, InvalidateOptions, QueryClient, QueryFilters, QueryKey, QueryObserver,
    QueryOptions, QueryStatus, RetryDelay, StaleTime, StructuralShare,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn equal_keys_share_one_query() {
    run_local(async {
        let client = QueryClient::default();
        let left = QueryKey::from(vec![json!("todos"), json!({ "page": 1, "done": false })]);
        let right = QueryKey::from(vec![json!("todos"), json!({ "done": false, "page": 1 })]);
        assert_eq!(hash_key(&left), hash_key(&right));

        let a = client
            .query_cache()
            .build(client.default_query_options(QueryOptions::<u32>::new(left)))
            .unwrap();
        let b = client
            .query_cache()
            .build(client.default_query_options(QueryOptions::<u32>::new(right)))
            .unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(client.query_cache().get_all().len(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_run_the_query_fn_once() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let slow = |calls: &Rc<Cell<u32>>| {
            let calls = calls.clone();
            QueryOptions::<u32>::new("dedup").set_query_fn(move |_| {
                calls.set(calls.get() + 1);
                async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(7)
                }
            })
        };
        let (a, b) = futures::join!(client.fetch_query(slow(&calls)), client.fetch_query(slow(&calls)));
        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(calls.get(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn unobserved_query_is_collected_after_gc_time() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let options = counting("gc", &calls).set_gc_time(Duration::from_millis(50));
        let hash = hash_key(&QueryKey::from("gc"));

        let observer = QueryObserver::new(&client, options).unwrap();
        let key = observer.subscribe(|_| {});
        advance(1).await;
        assert_eq!(observer.get_current_result().data, Some(1));

        observer.unsubscribe(key);
        advance(49).await;
        assert!(client.query_cache().get(&hash).is_some());
        advance(2).await;
        assert!(client.query_cache().get(&hash).is_none());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn observed_query_is_never_collected() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let options = counting("kept", &calls).set_gc_time(Duration::from_millis(10));
        let observer = QueryObserver::new(&client, options).unwrap();
        let _key = observer.subscribe(|_| {});
        advance(100).await;
        assert!(client.query_cache().get(&hash_key(&QueryKey::from("kept"))).is_some());
    })
    .await;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Todo {
    id: String,
    #[serde(default)]
    done: bool,
}

impl StructuralShare for Todo {}

#[tokio::test(start_paused = true)]
async fn refetch_keeps_identity_of_unchanged_items() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let options = || {
            let calls = calls.clone();
            QueryOptions::<Vec<Rc<Todo>>>::new("todos").set_query_fn(move |_| {
                calls.set(calls.get() + 1);
                let second = calls.get() > 1;
                async move {
                    Ok(vec![
                        Rc::new(Todo {
                            id: "1".into(),
                            done: false,
                        }),
                        Rc::new(Todo {
                            id: "2".into(),
                            done: second,
                        }),
                    ])
                }
            })
        };

        let first = client.fetch_query(options()).await.unwrap();
        advance(1).await;
        let second = client.fetch_query(options()).await.unwrap();
        assert_eq!(calls.get(), 2);
        assert!(Rc::ptr_eq(&first[0], &second[0]));
        assert!(!Rc::ptr_eq(&first[1], &second[1]));
        assert!(second[1].done);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn retries_then_errors_after_three_invocations() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let options = QueryOptions::<u32>::new("failing")
            .set_retry(2)
            .set_retry_delay(RetryDelay::Fixed(Duration::from_millis(1)))
            .set_query_fn(move |_| {
                counter.set(counter.get() + 1);
                async { Err(FetchError::msg("boom")) }
            });

        let observer = QueryObserver::new(&client, options).unwrap();
        let (results, listener) = recorder::<u32>();
        let _key = observer.subscribe(listener);
        advance(10).await;

        assert_eq!(calls.get(), 3);
        let failure_counts: Vec<u32> = results.borrow().iter().map(|result| result.failure_count).collect();
        assert_eq!(failure_counts.first(), Some(&0));
        assert!(failure_counts.contains(&1));
        assert!(failure_counts.contains(&2));
        let last = observer.get_current_result();
        assert_eq!(last.status, QueryStatus::Error);
        assert_eq!(last.fetch_status, FetchStatus::Idle);
        assert_eq!(last.failure_count, 3);
        assert_eq!(last.error.map(|error| error.to_string()), Some("boom".to_string()));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn invalidating_an_observed_query_refetches_once() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let options = QueryOptions::<String>::new("greeting")
            .set_stale_time(StaleTime::Infinite)
            .set_query_fn(move |_| {
                counter.set(counter.get() + 1);
                async { Ok("v2".to_string()) }
            });
        client.set_query_data("greeting", "v1".to_string()).unwrap();

        let observer = QueryObserver::new(&client, options).unwrap();
        let _key = observer.subscribe(|_| {});
        assert_eq!(calls.get(), 0);
        assert!(!observer.get_current_result().is_stale);

        let refetch = client.invalidate_queries(QueryFilters::key("greeting"), InvalidateOptions::default());
        let during = observer.get_current_result();
        assert!(during.is_stale);
        assert!(during.is_fetching);
        assert_eq!(during.data.as_deref(), Some("v1"));

        refetch.await;
        assert_eq!(calls.get(), 1);
        let after = observer.get_current_result();
        assert_eq!(after.data.as_deref(), Some("v2"));
        assert!(!after.is_stale);
        assert!(!after.is_fetching);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn pending_then_success_then_stale() {
    run_local(async {
        let client = QueryClient::default();
        let options = QueryOptions::<u32>::new("scenario").set_query_fn(|_| async { Ok(1) });
        let observer = QueryObserver::new(&client, options).unwrap();
        let (results, listener) = recorder::<u32>();
        let _key = observer.subscribe(listener);

        let first = results.borrow().first().cloned().unwrap();
        assert_eq!(first.status, QueryStatus::Pending);
        assert_eq!(first.data, None);

        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        let success = observer.get_current_result();
        assert_eq!(success.status, QueryStatus::Success);
        assert_eq!(success.data, Some(1));
        assert!(!success.is_stale);

        advance(2).await;
        let last = results.borrow().last().cloned().unwrap();
        assert_eq!(last.data, Some(1));
        assert!(last.is_stale);
        assert!(results.borrow().iter().any(|result| result.is_success && !result.is_stale));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn offline_fetch_pauses_until_reconnect() {
    run_local(async {
        let client = QueryClient::default();
        client.mount();
        client.environment().online.set_online(false);

        let calls = Rc::new(Cell::new(0));
        let observer = QueryObserver::new(&client, counting("offline", &calls)).unwrap();
        let _key = observer.subscribe(|_| {});
        advance(100).await;
        let paused = observer.get_current_result();
        assert_eq!(paused.fetch_status, FetchStatus::Paused);
        assert!(paused.is_paused);
        assert_eq!(calls.get(), 0);

        client.environment().online.set_online(true);
        advance(1).await;
        assert_eq!(calls.get(), 1);
        let done = observer.get_current_result();
        assert_eq!(done.status, QueryStatus::Success);
        assert_eq!(done.fetch_status, FetchStatus::Idle);
        assert_eq!(done.data, Some(1));
        client.unmount();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn background_error_keeps_cached_data() {
    run_local(async {
        let client = QueryClient::default();
        client.set_query_data("kept", 1_u32).unwrap();
        advance(1).await;
        let failing = QueryOptions::<u32>::new("kept").set_query_fn(|_| async { Err(FetchError::msg("offline")) });
        assert!(client.fetch_query(failing).await.is_err());

        let state = client.get_query_state::<u32>(&QueryKey::from("kept")).unwrap();
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(1));
        assert!(state.error.is_some());
    })
    .await;
}
