//! Graph model and construction.
//!
//! A workflow is a directed graph of typed nodes connected by edges, built
//! with [`GraphBuilder`] and validated into an immutable [`GraphDefinition`]
//! at publish time. Configuration problems are fatal here, never at run
//! time: a definition that validates will not surprise a worker later.
//!
//! Parallel sections are declared as branch chains on a
//! [`Node::Parallel`]; building the definition synthesizes the paired join
//! node, the intra-branch edges, and re-homes the parallel node's outgoing
//! edges onto the join (see [`builder`]).

mod builder;
mod guard;
mod model;
mod registry;

pub use builder::{Branch, GraphBuilder};
pub use guard::{CompareOp, Guard};
pub use model::{ActionSpec, CallbackSpec, Edge, GraphDefinition, Node};
pub use registry::DefinitionRegistry;

use miette::Diagnostic;
use thiserror::Error;

use crate::types::NodeId;

/// Validation errors raised while building a [`GraphDefinition`].
///
/// These are configuration errors: surfaced to the author at publish time
/// and never retried.
#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate node id: {id}")]
    #[diagnostic(code(waterflow::graphs::duplicate_node))]
    DuplicateNode { id: NodeId },

    #[error("Edge references unknown node '{id}'")]
    #[diagnostic(code(waterflow::graphs::unknown_node))]
    UnknownNode { id: NodeId },

    #[error("Graph has no start node")]
    #[diagnostic(code(waterflow::graphs::missing_start))]
    MissingStart,

    #[error("Graph has more than one start node")]
    #[diagnostic(code(waterflow::graphs::multiple_start))]
    MultipleStart,

    #[error("Node '{id}' has no inbound edge")]
    #[diagnostic(
        code(waterflow::graphs::no_inbound),
        help("every node except the start node needs at least one inbound edge")
    )]
    NoInbound { id: NodeId },

    #[error("Node '{id}' has no outbound edge")]
    #[diagnostic(
        code(waterflow::graphs::no_outbound),
        help("every node except end nodes needs at least one outbound edge")
    )]
    NoOutbound { id: NodeId },

    #[error("Node '{id}' is unreachable from the start node")]
    #[diagnostic(code(waterflow::graphs::unreachable))]
    Unreachable { id: NodeId },

    #[error("Condition node '{node}' has an unguarded outgoing edge to '{to}'")]
    #[diagnostic(
        code(waterflow::graphs::unguarded_condition_edge),
        help("every edge leaving a condition node needs a guard; use Guard::Else for the default")
    )]
    UnguardedConditionEdge { node: NodeId, to: NodeId },

    #[error("Condition node '{node}' has no else edge")]
    #[diagnostic(code(waterflow::graphs::missing_else))]
    MissingElseEdge { node: NodeId },

    #[error("Condition node '{node}' has more than one else edge")]
    #[diagnostic(code(waterflow::graphs::multiple_else))]
    MultipleElseEdges { node: NodeId },

    #[error("Condition node '{node}' has duplicate guards")]
    #[diagnostic(code(waterflow::graphs::duplicate_guard))]
    DuplicateGuard { node: NodeId },

    #[error("Guarded edge from non-condition node '{node}'")]
    #[diagnostic(
        code(waterflow::graphs::guard_outside_condition),
        help("only condition nodes route by guard; other nodes fan out to all successors")
    )]
    GuardOutsideCondition { node: NodeId },

    #[error("Parallel node '{id}' declares no branches")]
    #[diagnostic(code(waterflow::graphs::no_branches))]
    NoBranches { id: NodeId },

    #[error("Parallel node '{id}' declares an empty branch")]
    #[diagnostic(code(waterflow::graphs::empty_branch))]
    EmptyBranch { id: NodeId },

    #[error("Branch of parallel node '{parallel}' references node '{id}', which is not a state node")]
    #[diagnostic(
        code(waterflow::graphs::invalid_branch_node),
        help("branch chains are built from declared state nodes; route conditions and nested forks outside the branch declaration")
    )]
    InvalidBranchNode { parallel: NodeId, id: NodeId },

    #[error("Node '{id}' appears in more than one branch")]
    #[diagnostic(code(waterflow::graphs::shared_branch_node))]
    SharedBranchNode { id: NodeId },

    #[error("Parallel node '{id}' names an empty reducer")]
    #[diagnostic(code(waterflow::graphs::missing_reducer))]
    MissingReducer { id: NodeId },
}
