mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use waterflow::runtimes::{EngineConfig, FlowEngine};
use waterflow::stores::{InMemoryTokenStore, TokenStore};
use waterflow::token::Token;
use waterflow::types::{TokenStatus, TraceStatus};

#[tokio::test]
async fn lost_notification_is_recovered_from_the_store() {
    let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());

    // First engine persists the submission and dies before any worker ran;
    // the wakeup it sent is gone with it.
    let submission = {
        let engine = common::test_engine(Arc::clone(&store));
        engine.publish(common::linear_graph("linear")).await.unwrap();
        engine
            .submit("linear", json!({"x": 1}), "tester", "suite")
            .await
            .unwrap()
    };

    // A fresh engine over the same store needs nothing but the definition.
    let engine = common::test_engine(Arc::clone(&store));
    engine.publish(common::linear_graph("linear")).await.unwrap();
    engine.drain().await.unwrap();

    let report = engine.trace_report(&submission.trace_id).await.unwrap();
    assert_eq!(report.status, TraceStatus::Completed);
    let at_end = store
        .find_by_position(&submission.stream_id, "end", Some(TokenStatus::Archived))
        .await
        .unwrap();
    assert_eq!(at_end.len(), 1);
    assert_eq!(at_end[0].data, json!({"x": 1}));
}

#[tokio::test]
async fn mid_flight_state_resumes_where_the_worker_died() {
    let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
    let submission = {
        let engine = common::test_engine(Arc::clone(&store));
        engine.publish(common::linear_graph("linear")).await.unwrap();
        engine
            .submit("linear", json!({"x": 1}), "tester", "suite")
            .await
            .unwrap()
    };

    // Replay what a worker does up to the crash point: claim the root,
    // persist its successor pending at "work", archive the root. The
    // successor was never notified.
    let root = store.find(&submission.context_id).await.unwrap().unwrap();
    assert!(store.claim(&root.context_id).await.unwrap());
    store.save(&root.derive("work", root.data.clone())).await.unwrap();
    store.archive(&root.context_id).await.unwrap();

    let engine = common::test_engine(Arc::clone(&store));
    engine.publish(common::linear_graph("linear")).await.unwrap();
    engine.drain().await.unwrap();

    let report = engine.trace_report(&submission.trace_id).await.unwrap();
    assert_eq!(report.status, TraceStatus::Completed);
    assert_eq!(report.live, 0);
    let at_end = store
        .find_by_position(&submission.stream_id, "end", Some(TokenStatus::Archived))
        .await
        .unwrap();
    assert_eq!(at_end.len(), 1);
}

#[tokio::test]
async fn abandoned_claim_is_released_after_its_lease_and_redriven() {
    let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
    let submission = {
        let engine = common::test_engine(Arc::clone(&store));
        engine.publish(common::linear_graph("linear")).await.unwrap();
        engine
            .submit("linear", json!({"x": 1}), "tester", "suite")
            .await
            .unwrap()
    };

    // A worker claimed the root and died before persisting anything else.
    // Successor persist + archive is a single store transition, so the
    // stuck claim is the only state a crash can leave behind here.
    assert!(store.claim(&submission.context_id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(30)).await;

    let config = EngineConfig {
        claim_lease: Duration::from_millis(10),
        ..common::fast_config()
    };
    let engine = FlowEngine::builder(Arc::clone(&store))
        .with_config(config)
        .with_capabilities(common::base_capabilities())
        .with_reducers(common::base_reducers())
        .build();
    engine.publish(common::linear_graph("linear")).await.unwrap();
    engine.drain().await.unwrap();

    let report = engine.trace_report(&submission.trace_id).await.unwrap();
    assert_eq!(report.status, TraceStatus::Completed);
    assert_eq!(report.live, 0);
    let root = store.find(&submission.context_id).await.unwrap().unwrap();
    assert_eq!(root.status, TokenStatus::Archived);
    let at_end = store
        .find_by_position(&submission.stream_id, "end", Some(TokenStatus::Archived))
        .await
        .unwrap();
    assert_eq!(at_end.len(), 1);
}

#[tokio::test]
async fn pending_token_at_unknown_position_freezes_the_trace() {
    let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
    let engine = common::test_engine(Arc::clone(&store));
    engine.publish(common::linear_graph("linear")).await.unwrap();
    let submission = engine
        .submit("linear", json!({"x": 1}), "tester", "suite")
        .await
        .unwrap();

    // A token at a position the definition does not know, as a bad manual
    // repair or a definition mismatch would leave behind.
    let mut ghost = Token::root(
        &submission.stream_id,
        &submission.trace_id,
        "ghost",
        json!({}),
    );
    ghost.status = TokenStatus::Pending;
    let ghost = store.save(&ghost).await.unwrap();

    engine.drain().await.unwrap();

    let report = engine.trace_report(&submission.trace_id).await.unwrap();
    assert_eq!(report.status, TraceStatus::Frozen);

    // The ghost token is left untouched for inspection, and a second drain
    // skips it without erroring.
    let before = store.find_by_trace(&submission.trace_id).await.unwrap();
    engine.drain().await.unwrap();
    let after = store.find_by_trace(&submission.trace_id).await.unwrap();
    assert_eq!(before, after);
    let ghost = store.find(&ghost.context_id).await.unwrap().unwrap();
    assert_eq!(ghost.status, TokenStatus::Pending);
}

#[tokio::test]
async fn drain_is_idempotent_on_a_finished_trace() {
    let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
    let engine = common::test_engine(Arc::clone(&store));
    engine.publish(common::linear_graph("linear")).await.unwrap();
    let submission = engine
        .submit("linear", json!({"x": 1}), "tester", "suite")
        .await
        .unwrap();

    engine.drain().await.unwrap();
    let before = store.find_by_trace(&submission.trace_id).await.unwrap();
    engine.drain().await.unwrap();
    let after = store.find_by_trace(&submission.trace_id).await.unwrap();
    assert_eq!(before, after);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_backed_run_survives_a_full_restart() {
    use waterflow::stores::SqliteTokenStore;

    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("recovery.db").display());

    let submission = {
        let store: Arc<dyn TokenStore> = Arc::new(SqliteTokenStore::connect(&url).await.unwrap());
        let engine = common::test_engine(store);
        engine.publish(common::linear_graph("linear")).await.unwrap();
        engine
            .submit("linear", json!({"x": 1}), "tester", "suite")
            .await
            .unwrap()
    };

    // Fresh pool, fresh engine, same file.
    let store: Arc<dyn TokenStore> = Arc::new(SqliteTokenStore::connect(&url).await.unwrap());
    let engine = common::test_engine(Arc::clone(&store));
    engine.publish(common::linear_graph("linear")).await.unwrap();
    engine.drain().await.unwrap();

    let report = engine.trace_report(&submission.trace_id).await.unwrap();
    assert_eq!(report.status, TraceStatus::Completed);
    let at_end = store
        .find_by_position(&submission.stream_id, "end", Some(TokenStatus::Archived))
        .await
        .unwrap();
    assert_eq!(at_end.len(), 1);
    assert_eq!(at_end[0].data, json!({"x": 1}));
}
