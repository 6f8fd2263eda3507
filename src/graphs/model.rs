//! Immutable graph definition and its node/edge types.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::guard::Guard;
use crate::types::{NodeId, ParallelMode};

/// Declared capability invocation carried by a state node.
///
/// The runtime resolves the variant's operation name against the capability
/// registry; the business logic behind it is a collaborator, not part of
/// this crate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActionSpec {
    /// Pass the payload through unchanged. The implicit action of state
    /// nodes that declare none.
    Echo,
    /// Invoke a named general-purpose capability (fitable).
    General {
        name: String,
        fitable: String,
        params: FxHashMap<String, Value>,
    },
    /// Evaluate a named script entry point.
    Script {
        name: String,
        entry: String,
        params: FxHashMap<String, Value>,
    },
    /// Write the payload to an external target.
    Store {
        name: String,
        target: String,
        params: FxHashMap<String, Value>,
    },
    /// Invoke a generic capability resolved at run time.
    Genericable {
        name: String,
        fitable: String,
        params: FxHashMap<String, Value>,
    },
}

impl ActionSpec {
    /// Registry key the runtime dispatches this action on.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            ActionSpec::Echo => "echo",
            ActionSpec::General { .. } => "general",
            ActionSpec::Script { .. } => "script",
            ActionSpec::Store { .. } => "store",
            ActionSpec::Genericable { .. } => "genericable",
        }
    }

    /// The capability reference this action names, if any. Recorded in the
    /// usage index so operators can answer "which definitions call this".
    #[must_use]
    pub fn fitable(&self) -> Option<&str> {
        match self {
            ActionSpec::Echo => None,
            ActionSpec::General { fitable, .. } | ActionSpec::Genericable { fitable, .. } => {
                Some(fitable)
            }
            ActionSpec::Script { entry, .. } => Some(entry),
            ActionSpec::Store { target, .. } => Some(target),
        }
    }
}

/// Completion callback declared on a state node.
///
/// Invoked after the node's action succeeds, with the payload narrowed to
/// `filtered_keys` (empty set means the full payload). Callback failures
/// are logged, never propagated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackSpec {
    pub name: String,
    pub filtered_keys: Vec<String>,
    pub fitables: Vec<String>,
    pub converter: Option<String>,
}

impl CallbackSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filtered_keys: Vec::new(),
            fitables: Vec::new(),
            converter: None,
        }
    }

    #[must_use]
    pub fn with_filtered_keys(mut self, keys: Vec<String>) -> Self {
        self.filtered_keys = keys;
        self
    }
}

/// A node of the workflow graph.
///
/// The variant set is closed: validation exhaustively understands every
/// kind, and workers match on it without downcasts. `Join` nodes are never
/// declared by authors; the builder synthesizes one per parallel node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// Entry point; exactly one per graph.
    Start { id: NodeId },
    /// Terminal; archives arriving tokens.
    End { id: NodeId },
    /// Executes an action, fires an optional callback, forwards to all
    /// successors. A `critical` state failing its action fails the whole
    /// trace instead of just the token.
    State {
        id: NodeId,
        action: Option<ActionSpec>,
        callback: Option<CallbackSpec>,
        critical: bool,
    },
    /// Routes to exactly one successor by guard evaluation.
    Condition { id: NodeId },
    /// Forks one child token per branch.
    Parallel {
        id: NodeId,
        branch_heads: Vec<NodeId>,
        mode: ParallelMode,
        reducer: String,
    },
    /// Synthesized aggregator paired with a parallel node.
    Join {
        id: NodeId,
        parallel: NodeId,
        mode: ParallelMode,
        reducer: String,
    },
}

impl Node {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Node::Start { id }
            | Node::End { id }
            | Node::State { id, .. }
            | Node::Condition { id }
            | Node::Parallel { id, .. }
            | Node::Join { id, .. } => id,
        }
    }

    /// Human-readable kind name used in errors and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Start { .. } => "start",
            Node::End { .. } => "end",
            Node::State { .. } => "state",
            Node::Condition { .. } => "condition",
            Node::Parallel { .. } => "parallel",
            Node::Join { .. } => "join",
        }
    }

    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(self, Node::Start { .. })
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Node::End { .. })
    }

    #[must_use]
    pub fn is_condition(&self) -> bool {
        matches!(self, Node::Condition { .. })
    }
}

/// Directed edge between two nodes, optionally guarded.
///
/// Only edges leaving a condition node carry guards; all other nodes fan
/// out to every successor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub guard: Option<Guard>,
}

impl Edge {
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
        }
    }

    pub fn guarded(from: impl Into<NodeId>, to: impl Into<NodeId>, guard: Guard) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: Some(guard),
        }
    }
}

/// A validated, immutable workflow graph.
///
/// Produced by [`GraphBuilder::build`](super::GraphBuilder::build); the
/// constructor is crate-private so every definition in circulation has
/// passed validation. Identified by `(definition_id, meta_id, version)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub definition_id: String,
    pub meta_id: String,
    pub version: String,
    nodes: FxHashMap<NodeId, Node>,
    edges: Vec<Edge>,
    /// Indices into `edges`, preserving declaration order per source node.
    outgoing: FxHashMap<NodeId, Vec<usize>>,
    start: NodeId,
}

impl GraphDefinition {
    pub(super) fn new(
        definition_id: String,
        meta_id: String,
        version: String,
        nodes: FxHashMap<NodeId, Node>,
        edges: Vec<Edge>,
        start: NodeId,
    ) -> Self {
        let mut outgoing: FxHashMap<NodeId, Vec<usize>> = FxHashMap::default();
        for (i, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.from.clone()).or_default().push(i);
        }
        Self {
            definition_id,
            meta_id,
            version,
            nodes,
            edges,
            outgoing,
            start,
        }
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Outgoing edges of a node in declaration order.
    pub fn out_edges(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    #[must_use]
    pub fn start_node(&self) -> &str {
        &self.start
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// Every capability reference named by actions in this definition.
    pub fn fitables(&self) -> impl Iterator<Item = &str> {
        self.nodes.values().filter_map(|node| match node {
            Node::State {
                action: Some(action),
                ..
            } => action.fitable(),
            _ => None,
        })
    }
}

/// Derive the id of the join node synthesized for a parallel node.
#[must_use]
pub(super) fn join_id(parallel_id: &str) -> NodeId {
    format!("{parallel_id}__join")
}
