mod common;

use std::{cell::Cell, rc::Rc, time::Duration};

use common::{advance, counting, run_local};
use query_sync::{
    FetchError, InvalidateOptions, MutationFilters, MutationObserver, MutationOptions, MutationStatus,
    QueryClient, QueryFilters, QueryKey, QueryObserver, StaleTime,
};

#[tokio::test(start_paused = true)]
async fn optimistic_update_rolls_back_on_error() {
    run_local(async {
        let client = QueryClient::default();
        client.set_query_data("todos", vec!["a".to_string()]).unwrap();

        let on_mutate_client = client.clone();
        let on_error_client = client.clone();
        let options = MutationOptions::<(), String, Vec<String>>::new(|_todo: String| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(FetchError::msg("rejected"))
        })
        .set_on_mutate(move |todo: String| {
            let client = on_mutate_client.clone();
            async move {
                let previous = client
                    .get_query_data::<Vec<String>>(&QueryKey::from("todos"))
                    .unwrap_or_default();
                client.update_query_data::<Vec<String>>("todos", |old| {
                    let mut next = old.cloned().unwrap_or_default();
                    next.push(todo);
                    Some(next)
                })?;
                Ok::<_, FetchError>(previous)
            }
        })
        .set_on_error(move |_error, _todo, previous| {
            if let Some(previous) = previous {
                if let Err(error) = on_error_client.set_query_data("todos", previous.clone()) {
                    panic!("rollback failed: {error}");
                }
            }
        });

        let observer = MutationObserver::new(&client, options);
        let mutation = observer.mutate("b".to_string());
        futures::pin_mut!(mutation);
        assert!(futures::poll!(mutation.as_mut()).is_pending());
        advance(1).await;
        assert_eq!(
            client.get_query_data::<Vec<String>>(&QueryKey::from("todos")),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(client.is_mutating(&MutationFilters::default()), 1);

        let error = mutation.await.unwrap_err();
        assert_eq!(error.fetch_error().map(ToString::to_string).as_deref(), Some("rejected"));
        assert_eq!(
            client.get_query_data::<Vec<String>>(&QueryKey::from("todos")),
            Some(vec!["a".to_string()])
        );

        let result = observer.get_current_result();
        assert_eq!(result.status, MutationStatus::Error);
        assert!(result.is_error);
        assert_eq!(result.variables.as_deref(), Some("b"));
        assert_eq!(result.context, Some(vec!["a".to_string()]));
        assert_eq!(client.is_mutating(&MutationFilters::default()), 0);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn successful_mutation_invalidates_observed_query() {
    run_local(async {
        let client = QueryClient::default();
        let calls = Rc::new(Cell::new(0));
        let query = QueryObserver::new(&client, counting("count", &calls).set_stale_time(StaleTime::Infinite)).unwrap();
        let _key = query.subscribe(|_| {});
        advance(1).await;
        assert_eq!(query.get_current_result().data, Some(1));

        let invalidating = client.clone();
        let options = MutationOptions::<u32, u32>::new(|step: u32| async move { Ok(step * 2) })
            .set_mutation_key("increment")
            .set_on_success(move |_data, _step, _context| {
                drop(invalidating.invalidate_queries(QueryFilters::key("count"), InvalidateOptions::default()));
            });
        let observer = MutationObserver::new(&client, options);
        let updates = Rc::new(Cell::new(0));
        let counter = updates.clone();
        let _listener = observer.subscribe(move |_| counter.set(counter.get() + 1));

        assert_eq!(observer.mutate(21).await.unwrap(), 42);
        let result = observer.get_current_result();
        assert!(result.is_success);
        assert_eq!(result.data, Some(42));
        assert!(updates.get() >= 2);

        advance(1).await;
        assert_eq!(calls.get(), 2);
        assert_eq!(query.get_current_result().data, Some(2));
        assert_eq!(client.mutation_cache().find_all(&MutationFilters::key("increment")).len(), 1);

        observer.reset();
        let reset = observer.get_current_result();
        assert!(reset.is_idle);
        assert_eq!(reset.data, None);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn missing_mutation_fn_is_an_error() {
    run_local(async {
        let client = QueryClient::default();
        let observer = MutationObserver::new(&client, MutationOptions::<u32, u32>::default());
        let error = observer.mutate(1).await.unwrap_err();
        assert!(matches!(error, query_sync::QueryError::MissingMutationFn));
    })
    .await;
}
