//! End-to-end runs against a worker on its own thread.

mod fixture;

use std::sync::Arc;
use std::time::Duration;

use fixture::{MemoryFactory, FAILURE_MESSAGE};
use futures::future::join_all;
use pagefind_dispatch::worker::{DispatchError, Dispatcher, DispatcherState};
use pagefind_dispatch::{DispatcherConfig, SearchEnvironment, SearchOptions};
use serde_json::Value;

async fn threaded(factory: Arc<MemoryFactory>) -> Dispatcher {
    let dispatcher = Dispatcher::threaded(DispatcherConfig::default(), factory);
    assert_eq!(dispatcher.init().await, DispatcherState::ReadyWorker);
    dispatcher
}

async fn in_process() -> Dispatcher {
    let dispatcher = Dispatcher::threaded(
        DispatcherConfig::default().without_worker(),
        MemoryFactory::new(),
    );
    assert_eq!(dispatcher.init().await, DispatcherState::ReadyFallback);
    dispatcher
}

async fn loaded(dispatcher: &Dispatcher, term: &str) -> Vec<(String, Value)> {
    let results = dispatcher.search(term, SearchOptions::default()).await.unwrap();
    let mut pages = Vec::new();
    for hit in &results.results {
        pages.push((hit.id.clone(), hit.data.load().await.unwrap()));
    }
    pages
}

#[tokio::test]
async fn test_worker_builds_its_own_engine() {
    let factory = MemoryFactory::new();
    let dispatcher = threaded(Arc::clone(&factory)).await;

    // Only the worker's engine; no fallback was needed
    assert_eq!(factory.created(), 1);
    dispatcher.destroy().await.unwrap();
}

#[tokio::test]
async fn test_both_modes_return_the_same_results() {
    let worker = threaded(MemoryFactory::new()).await;
    let local = in_process().await;

    for term in ["rust", "release", "nothing matches this"] {
        assert_eq!(loaded(&worker, term).await, loaded(&local, term).await);
    }
    assert_eq!(worker.filters().await.unwrap(), local.filters().await.unwrap());

    worker.destroy().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_searches_get_their_own_results() {
    let worker = threaded(MemoryFactory::new()).await;
    let local = in_process().await;

    let terms = ["rust", "release", "async", "executor", "notes"];
    let searches = terms
        .iter()
        .map(|term| worker.search(term, SearchOptions::default()));
    let answers = join_all(searches).await;

    for (term, answer) in terms.iter().zip(answers) {
        let ids: Vec<String> = answer.unwrap().results.into_iter().map(|hit| hit.id).collect();
        let expected: Vec<String> = local
            .search(term, SearchOptions::default())
            .await
            .unwrap()
            .results
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        assert_eq!(ids, expected, "results for {term}");
    }

    worker.destroy().await.unwrap();
}

#[tokio::test]
async fn test_both_modes_report_the_same_errors() {
    let worker = threaded(MemoryFactory::new()).await;
    let local = in_process().await;

    let remote = worker.search("explode", SearchOptions::default()).await.unwrap_err();
    let direct = local.search("explode", SearchOptions::default()).await.unwrap_err();

    assert!(matches!(remote, DispatchError::Remote(_)));
    assert!(matches!(direct, DispatchError::Engine(_)));
    assert_eq!(remote.to_string(), FAILURE_MESSAGE);
    assert_eq!(remote.to_string(), direct.to_string());

    // A failed call leaves the worker in charge
    assert_eq!(worker.state(), DispatcherState::ReadyWorker);
    worker.destroy().await.unwrap();
}

#[tokio::test]
async fn test_verbose_stamp_names_the_serving_side() {
    let worker = threaded(MemoryFactory::new()).await;
    let local = in_process().await;

    let remote = worker.search("rust", SearchOptions::verbose()).await.unwrap();
    let direct = local.search("rust", SearchOptions::verbose()).await.unwrap();

    assert_eq!(remote.search_environment, Some(SearchEnvironment::Worker));
    assert_eq!(direct.search_environment, Some(SearchEnvironment::MainThread));
    worker.destroy().await.unwrap();
}

#[tokio::test]
async fn test_data_handles_round_trip() {
    let dispatcher = threaded(MemoryFactory::new()).await;

    let results = dispatcher.search("rust", SearchOptions::default()).await.unwrap();
    let handle = results.results[0].data.handle_id().unwrap().to_string();
    assert!(handle.starts_with("data_msg_"));
    assert!(handle.ends_with("_0"));

    let page = dispatcher.get_data(&handle).await.unwrap();
    assert_eq!(page["url"], "/docs/intro/");
    assert_eq!(results.results[0].data.load().await.unwrap(), page);

    dispatcher.destroy().await.unwrap();
}

#[tokio::test]
async fn test_released_handle_is_gone() {
    let dispatcher = threaded(MemoryFactory::new()).await;

    let results = dispatcher.search("rust", SearchOptions::default()).await.unwrap();
    let accessor = results.results[0].data.clone();
    let handle = accessor.handle_id().unwrap().to_string();

    accessor.release();

    let err = accessor.load().await.unwrap_err();
    assert_eq!(err.to_string(), format!("Data function {handle} not found"));

    // The other hit is untouched
    results.results[1].data.load().await.unwrap();
    dispatcher.destroy().await.unwrap();
}

#[tokio::test]
async fn test_newer_debounced_search_wins_in_worker() {
    let dispatcher = threaded(MemoryFactory::new()).await;

    let debounce = Some(Duration::from_millis(50));
    let (older, newer) = tokio::join!(
        dispatcher.debounced_search("rust", SearchOptions::default(), debounce),
        dispatcher.debounced_search("async", SearchOptions::default(), debounce),
    );

    assert!(older.unwrap().is_none());
    let newer = newer.unwrap().unwrap();
    assert_eq!(newer.results.len(), 1);
    assert_eq!(newer.results[0].id, "/docs/async/");

    dispatcher.destroy().await.unwrap();
}

#[tokio::test]
async fn test_index_operations_succeed_in_worker() {
    let dispatcher = threaded(MemoryFactory::new()).await;

    dispatcher.enter_playground_mode().await.unwrap();
    dispatcher
        .merge_index("/other/pagefind/", Default::default())
        .await
        .unwrap();
    dispatcher.options(Default::default()).await.unwrap();
    dispatcher.preload("ru", SearchOptions::default()).await.unwrap();

    assert_eq!(dispatcher.pending_calls(), 0);
    assert_eq!(dispatcher.unmatched_responses(), 0);
    dispatcher.destroy().await.unwrap();
}

#[tokio::test]
async fn test_destroy_stops_worker() {
    let dispatcher = threaded(MemoryFactory::new()).await;
    let results = dispatcher.search("rust", SearchOptions::default()).await.unwrap();

    dispatcher.destroy().await.unwrap();

    assert_eq!(dispatcher.state(), DispatcherState::Destroyed);
    let err = results.results[0].data.load().await.unwrap_err();
    assert!(matches!(err, DispatchError::Destroyed));
}
