mod common;

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use waterflow::stores::{InMemoryTokenStore, TokenStore};
use waterflow::token::{ForkGroup, StreamRecord, Token, TokenFailure, Trace};
use waterflow::types::{ParallelMode, TokenStatus, TraceStatus};

/// Contract every backend must satisfy.
async fn exercise_store(store: Arc<dyn TokenStore>) {
    // Save assigns a sequence once and keeps it across upserts.
    let mut root = Token::root("s1", "tr1", "start", json!({"x": 1}));
    root.status = TokenStatus::Pending;
    let root = store.save(&root).await.unwrap();
    assert!(root.seq > 0);
    let resaved = store.save(&root).await.unwrap();
    assert_eq!(resaved.seq, root.seq);

    let found = store.find(&root.context_id).await.unwrap().unwrap();
    assert_eq!(found.data, json!({"x": 1}));
    assert_eq!(found.status, TokenStatus::Pending);

    // Position queries come back in sequence order.
    let second = store.save(&root.derive("start", json!({"x": 2}))).await.unwrap();
    let at_start = store
        .find_by_position("s1", "start", Some(TokenStatus::Pending))
        .await
        .unwrap();
    assert_eq!(at_start.len(), 2);
    assert!(at_start[0].seq < at_start[1].seq);
    assert_eq!(at_start[0].context_id, root.context_id);

    // Claim has exactly one winner per token.
    assert!(store.claim(&root.context_id).await.unwrap());
    assert!(!store.claim(&root.context_id).await.unwrap());
    assert!(!store.claim("no-such-token").await.unwrap());

    // Pending worklist reflects status changes.
    let pending = store.pending_positions().await.unwrap();
    assert_eq!(pending, vec![("s1".to_string(), "start".to_string())]);

    // Errors are recorded with the failure attached.
    store
        .record_error(
            &second.context_id,
            &TokenFailure::new("start", "action", "boom"),
        )
        .await
        .unwrap();
    let errored = store.find(&second.context_id).await.unwrap().unwrap();
    assert_eq!(errored.status, TokenStatus::Error);
    assert_eq!(errored.error.as_ref().unwrap().kind, "action");

    // Archive stamps the timestamp.
    store.archive(&root.context_id).await.unwrap();
    let archived = store.find(&root.context_id).await.unwrap().unwrap();
    assert_eq!(archived.status, TokenStatus::Archived);
    assert!(archived.archived_at.is_some());

    // Sent flag round-trips.
    let mut wire = Token::root("s1", "tr1", "work", json!({}));
    wire.status = TokenStatus::Pending;
    let wire = store.save(&wire).await.unwrap();
    store.mark_sent(&wire.context_id).await.unwrap();
    assert!(store.find(&wire.context_id).await.unwrap().unwrap().sent);

    // Fork group completion fires for exactly one caller.
    let group = ForkGroup {
        parallel_id: "p1".to_string(),
        batch_id: "b1".to_string(),
        stream_id: "s1".to_string(),
        branch_count: 2,
        emitted: false,
        created_at: Utc::now(),
    };
    store.create_fork_group(&group).await.unwrap();
    let loaded = store.fork_group("p1", "b1").await.unwrap().unwrap();
    assert_eq!(loaded.branch_count, 2);
    assert!(store.complete_join_batch("p1", "b1").await.unwrap());
    assert!(!store.complete_join_batch("p1", "b1").await.unwrap());
    assert!(store.complete_join_batch("p1", "missing").await.is_err());

    // Join buffer is idempotent per context id and ordered by arrival.
    let base = Token::root("s1", "tr1", "p", json!({}));
    let arrivals = store
        .save_all(&[
            base.fork_child("j", "p1", "b1", ParallelMode::All),
            base.fork_child("j", "p1", "b1", ParallelMode::All),
        ])
        .await
        .unwrap();
    let (arrival_a, arrival_b) = (arrivals[0].clone(), arrivals[1].clone());
    assert_eq!(store.buffer_join_arrival(&arrival_a).await.unwrap(), 1);
    assert_eq!(store.buffer_join_arrival(&arrival_a).await.unwrap(), 1);
    assert_eq!(store.buffer_join_arrival(&arrival_b).await.unwrap(), 2);
    let arrivals = store.join_arrivals("p1", "b1").await.unwrap();
    assert_eq!(arrivals.len(), 2);
    assert_eq!(arrivals[0].context_id, arrival_a.context_id);

    // Streams and traces round-trip; terminal trace status sticks.
    store
        .insert_stream(&StreamRecord {
            stream_id: "s1".to_string(),
            definition_id: "def".to_string(),
            trace_id: "tr1".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    assert_eq!(
        store.stream("s1").await.unwrap().unwrap().definition_id,
        "def"
    );

    let mut trace = Trace::new("tester", "suite", "start");
    trace.trace_id = "tr1".to_string();
    store.insert_trace(&trace).await.unwrap();
    store
        .update_trace_status("tr1", TraceStatus::Completed)
        .await
        .unwrap();
    store
        .update_trace_status("tr1", TraceStatus::Failed)
        .await
        .unwrap();
    let finished = store.trace("tr1").await.unwrap().unwrap();
    assert_eq!(finished.status, TraceStatus::Completed);
    assert!(finished.ended_at.is_some());
    assert!(store
        .update_trace_status("missing", TraceStatus::Failed)
        .await
        .is_err());

    // Usage index deduplicates per definition.
    store.record_usage("fit.a", "def1").await.unwrap();
    store.record_usage("fit.a", "def1").await.unwrap();
    store.record_usage("fit.a", "def2").await.unwrap();
    assert_eq!(
        store.usages_for("fit.a").await.unwrap(),
        vec!["def1".to_string(), "def2".to_string()]
    );
    assert!(store.usages_for("fit.unknown").await.unwrap().is_empty());

    // Cancellation errors out every live token of the stream.
    let mut live = Token::root("s2", "tr2", "work", json!({}));
    live.status = TokenStatus::Pending;
    store.save(&live).await.unwrap();
    assert_eq!(store.cancel_stream_tokens("s2").await.unwrap(), 1);
    assert_eq!(store.cancel_stream_tokens("s2").await.unwrap(), 0);

    // Successor persist and consumed-token archive land as one transition.
    let mut consumed = Token::root("s3", "tr3", "work", json!({}));
    consumed.status = TokenStatus::Pending;
    let consumed = store.save(&consumed).await.unwrap();
    assert!(store.claim(&consumed.context_id).await.unwrap());
    let successor = consumed.derive("end", json!({}));
    let stored = store
        .save_all_and_archive(std::slice::from_ref(&successor), &consumed.context_id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, TokenStatus::Pending);
    let consumed = store.find(&consumed.context_id).await.unwrap().unwrap();
    assert_eq!(consumed.status, TokenStatus::Archived);
    assert!(consumed.archived_at.is_some());

    // An unknown consumed token rolls the whole transition back.
    let orphan = consumed.derive("end", json!({}));
    assert!(store
        .save_all_and_archive(std::slice::from_ref(&orphan), "no-such-token")
        .await
        .is_err());
    assert!(store.find(&orphan.context_id).await.unwrap().is_none());

    // Stale claims are released back to pending past the cutoff.
    let mut stuck = Token::root("s3", "tr3", "work", json!({}));
    stuck.status = TokenStatus::Pending;
    let stuck = store.save(&stuck).await.unwrap();
    assert!(store.claim(&stuck.context_id).await.unwrap());
    assert_eq!(
        store
            .reset_stale_processing(Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        store
            .reset_stale_processing(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap(),
        1
    );
    let stuck = store.find(&stuck.context_id).await.unwrap().unwrap();
    assert_eq!(stuck.status, TokenStatus::Pending);
}

#[tokio::test]
async fn memory_store_contract() {
    exercise_store(Arc::new(InMemoryTokenStore::new())).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_store_contract() {
    use waterflow::stores::SqliteTokenStore;

    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("tokens.db").display());
    let store = SqliteTokenStore::connect(&url).await.unwrap();
    exercise_store(Arc::new(store)).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_store_survives_reconnect() {
    use waterflow::stores::SqliteTokenStore;

    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("tokens.db").display());

    let context_id = {
        let store = SqliteTokenStore::connect(&url).await.unwrap();
        let mut token = Token::root("s1", "tr1", "start", json!({"x": 7}));
        token.status = TokenStatus::Pending;
        store.save(&token).await.unwrap().context_id
    };

    let store = SqliteTokenStore::connect(&url).await.unwrap();
    let token = store.find(&context_id).await.unwrap().unwrap();
    assert_eq!(token.data, json!({"x": 7}));
    assert_eq!(token.status, TokenStatus::Pending);
}
