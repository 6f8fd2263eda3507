//! Token and trace records.
//!
//! A [`Token`] is the unit of work: a JSON payload located at exactly one
//! node position of a graph instance. Nodes consume a claimed token and
//! persist successor tokens at downstream positions; the chain of those
//! persisted transitions is the whole execution history, which is what makes
//! crash recovery a matter of re-scanning the store.
//!
//! A [`Trace`] groups every token descended from one external submission and
//! carries its terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{NodeId, ParallelMode, TokenStatus, TraceStatus};

/// The first unrecovered failure attached to a token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenFailure {
    /// Node at which the failure occurred.
    pub node_id: NodeId,
    /// Coarse error kind, e.g. `"action"`, `"callback"`, `"cancelled"`.
    pub kind: String,
    pub message: String,
}

impl TokenFailure {
    pub fn new(node_id: impl Into<NodeId>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// A typed unit of work flowing through a graph instance.
///
/// Identity fields:
/// - `context_id` — unique per token; the persistence key.
/// - `stream_id` — the graph instance (one live execution) this token
///   belongs to.
/// - `trace_id` — the submission this token descends from.
/// - `trans_id` — branch lineage: a token and its linear successors share a
///   `trans_id`; forked children get fresh ones.
/// - `root_id` — the `context_id` of the submission's root token.
///
/// Parallel correlation (`parallel_id`, `batch_id`, `parallel_mode`,
/// `to_batch`) is set on fork children and cleared again on the reduced
/// token a join emits (`joined = true`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub context_id: String,
    pub stream_id: String,
    pub trace_id: String,
    pub trans_id: String,
    pub root_id: String,
    /// Current node position. A token occupies exactly one position;
    /// movement means archiving this token and persisting successors.
    pub position_id: NodeId,
    pub data: Value,
    pub status: TokenStatus,
    pub parallel_id: Option<String>,
    pub parallel_mode: Option<ParallelMode>,
    pub batch_id: Option<String>,
    /// Set on fork children headed for a join batch.
    pub to_batch: bool,
    /// Set on the reduced token a join emits; such tokens are never folded
    /// into a batch again.
    pub joined: bool,
    /// Set once downstream has been notified about this token; audit only.
    /// Suppression of duplicate notification is structural: recovery
    /// re-drives pending tokens straight from the store without
    /// re-notifying, and the atomic claim absorbs any duplicates, so
    /// nothing consults this flag at run time.
    pub sent: bool,
    /// Store-assigned monotonic sequence, the per-position processing order.
    /// Zero until first saved.
    pub seq: u64,
    pub error: Option<TokenFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Token {
    /// Root token for a new submission, placed at the start node.
    ///
    /// `root_id` is its own `context_id`; status starts at `Created` and is
    /// promoted to `Pending` by the engine once the row is durable.
    #[must_use]
    pub fn root(
        stream_id: impl Into<String>,
        trace_id: impl Into<String>,
        position_id: impl Into<NodeId>,
        data: Value,
    ) -> Self {
        let context_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            root_id: context_id.clone(),
            context_id,
            stream_id: stream_id.into(),
            trace_id: trace_id.into(),
            trans_id: Uuid::new_v4().to_string(),
            position_id: position_id.into(),
            data,
            status: TokenStatus::Created,
            parallel_id: None,
            parallel_mode: None,
            batch_id: None,
            to_batch: false,
            joined: false,
            sent: false,
            seq: 0,
            error: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    /// Linear successor at the next position: same stream, trace, lineage
    /// and parallel correlation, fresh identity, status `Pending`.
    #[must_use]
    pub fn derive(&self, position_id: impl Into<NodeId>, data: Value) -> Self {
        let now = Utc::now();
        Self {
            context_id: Uuid::new_v4().to_string(),
            stream_id: self.stream_id.clone(),
            trace_id: self.trace_id.clone(),
            trans_id: self.trans_id.clone(),
            root_id: self.root_id.clone(),
            position_id: position_id.into(),
            data,
            status: TokenStatus::Pending,
            parallel_id: self.parallel_id.clone(),
            parallel_mode: self.parallel_mode,
            batch_id: self.batch_id.clone(),
            to_batch: self.to_batch,
            joined: false,
            sent: false,
            seq: 0,
            error: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    /// Fork child headed down one branch: fresh `trans_id`, shared batch
    /// correlation, `to_batch` set.
    #[must_use]
    pub fn fork_child(
        &self,
        position_id: impl Into<NodeId>,
        parallel_id: impl Into<String>,
        batch_id: impl Into<String>,
        mode: ParallelMode,
    ) -> Self {
        let mut child = self.derive(position_id, self.data.clone());
        child.trans_id = Uuid::new_v4().to_string();
        child.parallel_id = Some(parallel_id.into());
        child.batch_id = Some(batch_id.into());
        child.parallel_mode = Some(mode);
        child.to_batch = true;
        child
    }

    /// Reduced token emitted by a join: parallel correlation cleared, fresh
    /// `trans_id`, `joined` set so it can never be folded again.
    #[must_use]
    pub fn joined_successor(&self, position_id: impl Into<NodeId>, data: Value) -> Self {
        let mut next = self.derive(position_id, data);
        next.trans_id = Uuid::new_v4().to_string();
        next.parallel_id = None;
        next.batch_id = None;
        next.parallel_mode = None;
        next.to_batch = false;
        next.joined = true;
        next
    }

    /// Whether this token carries complete join-batch correlation.
    #[must_use]
    pub fn batch_key(&self) -> Option<(&str, &str)> {
        match (self.parallel_id.as_deref(), self.batch_id.as_deref()) {
            (Some(p), Some(b)) => Some((p, b)),
            _ => None,
        }
    }
}

/// One external submission: the root of a token family.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    /// Who submitted the work.
    pub operator: String,
    /// Which application submitted it.
    pub application: String,
    pub start_node: NodeId,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Trace {
    #[must_use]
    pub fn new(
        operator: impl Into<String>,
        application: impl Into<String>,
        start_node: impl Into<NodeId>,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            operator: operator.into(),
            application: application.into(),
            start_node: start_node.into(),
            status: TraceStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Durable record of one fork: how many branch children were produced for a
/// `(parallel_id, batch_id)` pair, and whether the join already emitted.
///
/// The aggregator reads `branch_count` from here, never from the in-memory
/// graph, so a join resumed after a crash observes the count the fork
/// actually produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForkGroup {
    pub parallel_id: String,
    pub batch_id: String,
    pub stream_id: String,
    pub branch_count: u32,
    pub emitted: bool,
    pub created_at: DateTime<Utc>,
}

/// Binding of one live execution (`stream_id`) to the definition it runs
/// and the trace it serves. Persisted so recovery can rebuild processors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub stream_id: String,
    pub definition_id: String,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_token_is_its_own_root() {
        let t = Token::root("s1", "tr1", "start", json!({"x": 1}));
        assert_eq!(t.root_id, t.context_id);
        assert_eq!(t.status, TokenStatus::Created);
        assert!(t.batch_key().is_none());
    }

    #[test]
    fn derive_keeps_lineage() {
        let root = Token::root("s1", "tr1", "start", json!({}));
        let next = root.derive("a", json!({"y": 2}));
        assert_eq!(next.trans_id, root.trans_id);
        assert_eq!(next.root_id, root.context_id);
        assert_ne!(next.context_id, root.context_id);
        assert_eq!(next.status, TokenStatus::Pending);
    }

    #[test]
    fn fork_child_carries_batch_correlation() {
        let root = Token::root("s1", "tr1", "p", json!({"x": 1}));
        let child = root.fork_child("b1", "par-1", "batch-1", ParallelMode::All);
        assert_ne!(child.trans_id, root.trans_id);
        assert!(child.to_batch);
        assert_eq!(child.batch_key(), Some(("par-1", "batch-1")));
        assert_eq!(child.data, root.data);
    }

    #[test]
    fn joined_successor_clears_correlation() {
        let root = Token::root("s1", "tr1", "p", json!({}));
        let child = root.fork_child("b1", "par-1", "batch-1", ParallelMode::All);
        let reduced = child.joined_successor("next", json!({"y": 5}));
        assert!(reduced.joined);
        assert!(!reduced.to_batch);
        assert!(reduced.batch_key().is_none());
        assert_eq!(reduced.trace_id, root.trace_id);
    }
}
