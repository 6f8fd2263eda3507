//! Durable token storage.
//!
//! The [`TokenStore`] trait is the recovery contract of the whole runtime:
//! every status transition is persisted here *before* anyone is notified,
//! so the store alone is sufficient to resume work after a crash.
//! Notifications are a liveness optimization on top.
//!
//! Two backends ship with the crate: [`InMemoryTokenStore`] for tests and
//! embedded single-process use, and [`SqliteTokenStore`] (behind the
//! default `sqlite` feature) for durable deployments. The trait seam admits
//! shared database backends for multi-process workers.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryTokenStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTokenStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::token::{ForkGroup, StreamRecord, Token, TokenFailure, Trace};
use crate::types::{TokenStatus, TraceStatus};

/// Errors raised by store backends.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("Storage backend error: {message}")]
    #[diagnostic(code(waterflow::stores::backend))]
    Backend { message: String },

    #[error("Serialization error: {source}")]
    #[diagnostic(code(waterflow::stores::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    #[error("No token with context id '{context_id}'")]
    #[diagnostic(code(waterflow::stores::token_not_found))]
    TokenNotFound { context_id: String },

    #[error("No trace with id '{trace_id}'")]
    #[diagnostic(code(waterflow::stores::trace_not_found))]
    TraceNotFound { trace_id: String },

    #[error("No fork group for parallel '{parallel_id}' batch '{batch_id}'")]
    #[diagnostic(
        code(waterflow::stores::fork_group_not_found),
        help("fork groups are persisted before branch children; an arrival without one indicates manual data edits")
    )]
    ForkGroupNotFound {
        parallel_id: String,
        batch_id: String,
    },
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend {
            message: err.to_string(),
        }
    }
}

/// Persistent home of tokens, traces, fork groups and join buffers.
///
/// Implementations must make [`claim`](TokenStore::claim) and
/// [`complete_join_batch`](TokenStore::complete_join_batch) atomic: they
/// are the idempotence points that let duplicate notifications and
/// concurrent workers coexist.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Upsert a token. Assigns the store sequence number on first save and
    /// preserves it afterwards; returns the stored token.
    async fn save(&self, token: &Token) -> Result<Token, StoreError>;

    /// Upsert a batch of tokens; all-or-nothing where the backend supports
    /// transactions.
    async fn save_all(&self, tokens: &[Token]) -> Result<Vec<Token>, StoreError>;

    /// Persist successor tokens and archive the consumed token as one
    /// atomic transition. A crash observes either the token still claimed
    /// or the fully advanced state, never persisted successors alongside a
    /// live consumed token. Fails without persisting anything when the
    /// consumed token does not exist.
    async fn save_all_and_archive(
        &self,
        tokens: &[Token],
        consumed_context_id: &str,
    ) -> Result<Vec<Token>, StoreError>;

    async fn find(&self, context_id: &str) -> Result<Option<Token>, StoreError>;

    /// Tokens at one position of one stream, ordered by sequence number
    /// (the per-branch processing order), optionally filtered by status.
    async fn find_by_position(
        &self,
        stream_id: &str,
        position_id: &str,
        status: Option<TokenStatus>,
    ) -> Result<Vec<Token>, StoreError>;

    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<Token>, StoreError>;

    /// Distinct `(stream_id, position_id)` pairs that currently hold
    /// pending tokens; the rescan worklist.
    async fn pending_positions(&self) -> Result<Vec<(String, String)>, StoreError>;

    /// Atomic `Pending → Processing` transition. Returns `false` when the
    /// token is not pending (already claimed, archived, or errored) —
    /// duplicate notifications land here and become no-ops.
    async fn claim(&self, context_id: &str) -> Result<bool, StoreError>;

    /// Release abandoned claims: every `Processing` token last updated
    /// before `older_than` goes back to `Pending`, where the rescan picks
    /// it up again. Returns the number of tokens released.
    async fn reset_stale_processing(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn update_status(
        &self,
        context_id: &str,
        status: TokenStatus,
    ) -> Result<(), StoreError>;

    /// Replace a token's payload in place (external signal merge).
    async fn update_data(&self, context_id: &str, data: &Value) -> Result<(), StoreError>;

    /// Record that downstream notification for this token went out. An
    /// audit marker; see [`Token::sent`].
    async fn mark_sent(&self, context_id: &str) -> Result<(), StoreError>;

    async fn archive(&self, context_id: &str) -> Result<(), StoreError>;

    /// Mark the token `Error` and attach its first unrecovered failure.
    async fn record_error(
        &self,
        context_id: &str,
        failure: &TokenFailure,
    ) -> Result<(), StoreError>;

    /// Mark every live token of a stream `Error` (stream cancellation).
    /// Returns the number of tokens affected.
    async fn cancel_stream_tokens(&self, stream_id: &str) -> Result<u64, StoreError>;

    async fn create_fork_group(&self, group: &ForkGroup) -> Result<(), StoreError>;

    async fn fork_group(
        &self,
        parallel_id: &str,
        batch_id: &str,
    ) -> Result<Option<ForkGroup>, StoreError>;

    /// Atomically flip the batch's emitted flag. Returns `true` for exactly
    /// one caller per batch; everyone else gets `false`.
    async fn complete_join_batch(
        &self,
        parallel_id: &str,
        batch_id: &str,
    ) -> Result<bool, StoreError>;

    /// Record a branch arrival in the durable join buffer, idempotently by
    /// context id. Returns the arrival count after the insert.
    async fn buffer_join_arrival(&self, token: &Token) -> Result<u32, StoreError>;

    /// Buffered arrivals for a batch, in arrival order.
    async fn join_arrivals(
        &self,
        parallel_id: &str,
        batch_id: &str,
    ) -> Result<Vec<Token>, StoreError>;

    async fn insert_stream(&self, stream: &StreamRecord) -> Result<(), StoreError>;

    async fn stream(&self, stream_id: &str) -> Result<Option<StreamRecord>, StoreError>;

    async fn insert_trace(&self, trace: &Trace) -> Result<(), StoreError>;

    async fn trace(&self, trace_id: &str) -> Result<Option<Trace>, StoreError>;

    /// Move a running trace to a new status, stamping `ended_at` for
    /// terminal statuses. A no-op when the trace already left `Running`.
    async fn update_trace_status(
        &self,
        trace_id: &str,
        status: TraceStatus,
    ) -> Result<(), StoreError>;

    /// Append to the capability usage index.
    async fn record_usage(&self, fitable: &str, definition_id: &str) -> Result<(), StoreError>;

    /// Definitions that reference a capability, in recording order.
    async fn usages_for(&self, fitable: &str) -> Result<Vec<String>, StoreError>;
}
