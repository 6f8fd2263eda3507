mod common;

use serde_json::json;
use std::sync::Arc;

use waterflow::stores::{InMemoryTokenStore, TokenStore};
use waterflow::types::{ParallelMode, TokenStatus, TraceStatus};

async fn run_mode(
    mode: ParallelMode,
) -> (Arc<dyn TokenStore>, String, Vec<waterflow::Token>) {
    let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
    let engine = common::test_engine(Arc::clone(&store));
    engine
        .publish(common::fork_join_graph("fork", mode))
        .await
        .unwrap();

    let submission = engine
        .submit("fork", json!({"x": 1}), "tester", "suite")
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let report = engine.trace_report(&submission.trace_id).await.unwrap();
    assert_eq!(report.status, TraceStatus::Completed);
    assert_eq!(report.live, 0);

    let at_end = store
        .find_by_position(&submission.stream_id, "end", Some(TokenStatus::Archived))
        .await
        .unwrap();
    (store, submission.stream_id, at_end)
}

#[tokio::test]
async fn all_mode_reduces_every_branch_once() {
    let (store, stream_id, at_end) = run_mode(ParallelMode::All).await;

    // Both branch contributions folded into exactly one reduced token.
    assert_eq!(at_end.len(), 1);
    assert_eq!(at_end[0].data, json!({"y": 5.0}));
    assert!(at_end[0].joined);
    assert!(at_end[0].batch_key().is_none());

    // Both branches ran and were archived.
    for branch in ["b1", "b2"] {
        let tokens = store
            .find_by_position(&stream_id, branch, Some(TokenStatus::Archived))
            .await
            .unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].to_batch);
    }
}

#[tokio::test]
async fn any_mode_emits_on_first_arrival_only() {
    let (_store, _stream_id, at_end) = run_mode(ParallelMode::Any).await;

    assert_eq!(at_end.len(), 1);
    let y = at_end[0].data.get("y").and_then(|v| v.as_f64()).unwrap();
    assert!(y == 2.0 || y == 3.0, "winner is one branch's contribution");
}

#[tokio::test]
async fn each_mode_emits_per_arrival() {
    let (_store, _stream_id, at_end) = run_mode(ParallelMode::Each).await;

    assert_eq!(at_end.len(), 2);
    let mut ys: Vec<f64> = at_end
        .iter()
        .filter_map(|t| t.data.get("y").and_then(|v| v.as_f64()))
        .collect();
    ys.sort_by(f64::total_cmp);
    assert_eq!(ys, vec![2.0, 3.0]);
}

#[tokio::test]
async fn completed_batch_ignores_late_arrivals() {
    let (store, stream_id, at_end) = run_mode(ParallelMode::All).await;
    assert_eq!(at_end.len(), 1);

    // Replay a branch arrival: a fresh pending token at the join with the
    // original batch correlation, as a duplicate notification would produce.
    let arrivals = store
        .find_by_position(&stream_id, "gather__join", Some(TokenStatus::Archived))
        .await
        .unwrap();
    let replayed = arrivals[0].derive("gather__join", arrivals[0].data.clone());
    store.save(&replayed).await.unwrap();

    let engine = common::test_engine(Arc::clone(&store));
    engine
        .publish(common::fork_join_graph("fork", ParallelMode::All))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    // The durable emitted flag swallows the replay: still one reduced token.
    let at_end = store
        .find_by_position(&stream_id, "end", Some(TokenStatus::Archived))
        .await
        .unwrap();
    assert_eq!(at_end.len(), 1);
    let replayed = store.find(&replayed.context_id).await.unwrap().unwrap();
    assert_eq!(replayed.status, TokenStatus::Archived);
}
