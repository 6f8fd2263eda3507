//! # Waterflow
//!
//! A persistent, crash-recoverable workflow runtime. Typed JSON tokens are
//! pushed through a directed graph of nodes — start, end, state, condition,
//! and parallel fork/join — by a reactive processor network with
//! credit-based flow control, backed by a durable token store.
//!
//! ## Execution model
//!
//! Every token transition is persisted *before* anyone is notified, which
//! collapses crash recovery into the normal code path: workers react to
//! best-effort wakeups and periodically rescan the store for pending
//! tokens, and an atomic claim per token makes duplicate deliveries
//! harmless. A fresh engine pointed at an existing store resumes
//! mid-flight work with no extra protocol.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use waterflow::graphs::GraphBuilder;
//! use waterflow::runtimes::FlowEngine;
//! use waterflow::stores::InMemoryTokenStore;
//! use waterflow::types::TraceStatus;
//!
//! # fn main() {
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let definition = GraphBuilder::new("hello")
//!     .add_start("start")
//!     .add_state("work")
//!     .add_end("end")
//!     .add_edge("start", "work")
//!     .add_edge("work", "end")
//!     .build()
//!     .expect("valid graph");
//!
//! let engine = FlowEngine::new(Arc::new(InMemoryTokenStore::new()));
//! engine.publish(definition).await.unwrap();
//!
//! let submission = engine
//!     .submit("hello", json!({"x": 1}), "docs", "quickstart")
//!     .await
//!     .unwrap();
//! engine.drain().await.unwrap();
//!
//! let report = engine.trace_report(&submission.trace_id).await.unwrap();
//! assert_eq!(report.status, TraceStatus::Completed);
//! # });
//! # }
//! ```
//!
//! For long-running deployments, [`runtimes::FlowEngine::start`] spawns
//! background workers instead of draining inline, and the `sqlite` feature
//! (default) provides [`stores::SqliteTokenStore`] for durable storage.
//!
//! ## Module map
//!
//! - [`graphs`] — graph model, builder, publish-time validation.
//! - [`token`] / [`types`] — token and trace records, lifecycle enums.
//! - [`stores`] — the durable [`stores::TokenStore`] contract and backends.
//! - [`processors`] — the credit-regulated processor network.
//! - [`coordination`] — scoped locks and the wakeup hub.
//! - [`capability`] — action/callback seams for business logic.
//! - [`reducers`] — join reduction strategies.
//! - [`runtimes`] — engine, workers, configuration.

pub mod capability;
pub mod coordination;
pub mod graphs;
pub mod processors;
pub mod reducers;
pub mod stores;
pub mod telemetry;
pub mod token;
pub mod types;
pub mod utils;

pub mod runtimes;

pub use runtimes::{EngineConfig, EngineError, FlowEngine};
pub use token::{Token, Trace};
pub use types::{ParallelMode, TokenStatus, TraceStatus};
