//! Core types for the Waterflow runtime.
//!
//! This module defines the fundamental identifiers and closed enums used
//! throughout the system: token lifecycle states, trace terminal states, and
//! the join policies for parallel execution. These are the domain concepts
//! that define what a flow execution *is*; runtime infrastructure lives in
//! [`crate::runtimes`].
//!
//! # Persistence
//!
//! Each enum supports a stable, human-readable string form through
//! `encode`/`decode`, used by the token store backends. Unknown encodings
//! decode to a conservative value rather than failing, so rows written by a
//! newer version never turn into runnable work under an older reader.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node within a graph definition.
///
/// Node ids are author-assigned strings, unique within one definition. The
/// synthesized join node paired with a parallel node derives its id from the
/// parallel node's id (see [`crate::graphs`]).
pub type NodeId = String;

/// Lifecycle state of a [`Token`](crate::token::Token).
///
/// Transitions follow `Created → Pending → Processing → {Archived | Error}`,
/// with successor tokens persisted `Pending` at the next position before any
/// worker is notified. `Archived` tokens are retained for audit and are never
/// reprocessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenStatus {
    /// Freshly constructed, not yet eligible for pickup.
    Created,
    /// Persisted at a position, waiting for a worker to claim it.
    Pending,
    /// Claimed by exactly one worker; the claim is the idempotence point
    /// for duplicate notifications.
    Processing,
    /// The node's action failed (or the stream was cancelled); terminal for
    /// this token, isolated from sibling branches.
    Error,
    /// Fully consumed; retained for audit only.
    Archived,
}

impl TokenStatus {
    /// Encode into the persisted string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            TokenStatus::Created => "CREATED",
            TokenStatus::Pending => "PENDING",
            TokenStatus::Processing => "PROCESSING",
            TokenStatus::Error => "ERROR",
            TokenStatus::Archived => "ARCHIVED",
        }
    }

    /// Decode a persisted string form. Unknown encodings decode to `Error`
    /// so a corrupted row can never be mistaken for runnable work.
    pub fn decode(s: &str) -> Self {
        match s {
            "CREATED" => TokenStatus::Created,
            "PENDING" => TokenStatus::Pending,
            "PROCESSING" => TokenStatus::Processing,
            "ARCHIVED" => TokenStatus::Archived,
            _ => TokenStatus::Error,
        }
    }

    /// Returns `true` once the token can no longer make progress.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TokenStatus::Error | TokenStatus::Archived)
    }

    /// Returns `true` while the token still represents live work.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Terminal and in-flight states of a [`Trace`](crate::token::Trace).
///
/// A trace is the top-level grouping of all tokens descended from one
/// external submission. `Frozen` marks a trace whose persisted state
/// references a position missing from the current graph definition; it is
/// surfaced to an operator and never auto-repaired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Frozen,
}

impl TraceStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            TraceStatus::Running => "RUNNING",
            TraceStatus::Completed => "COMPLETED",
            TraceStatus::Failed => "FAILED",
            TraceStatus::Cancelled => "CANCELLED",
            TraceStatus::Frozen => "FROZEN",
        }
    }

    pub fn decode(s: &str) -> Self {
        match s {
            "RUNNING" => TraceStatus::Running,
            "COMPLETED" => TraceStatus::Completed,
            "CANCELLED" => TraceStatus::Cancelled,
            "FROZEN" => TraceStatus::Frozen,
            _ => TraceStatus::Failed,
        }
    }

    /// Returns `true` once the trace has reached a reportable end state.
    /// `Frozen` counts as terminal: it requires operator intervention.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TraceStatus::Running)
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Join policy of a parallel node's aggregator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParallelMode {
    /// Emit the reduced token only once every branch has delivered exactly
    /// one child token for the batch. The buffer of already-arrived branch
    /// results is durable.
    All,
    /// Emit on first arrival; later arrivals for the same batch are
    /// discarded idempotently.
    Any,
    /// Emit a reduced token per arrival without waiting for siblings.
    Each,
}

impl ParallelMode {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ParallelMode::All => "ALL",
            ParallelMode::Any => "ANY",
            ParallelMode::Each => "EACH",
        }
    }

    pub fn decode(s: &str) -> Self {
        match s {
            "ANY" => ParallelMode::Any,
            "EACH" => ParallelMode::Each,
            _ => ParallelMode::All,
        }
    }
}

impl fmt::Display for ParallelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
