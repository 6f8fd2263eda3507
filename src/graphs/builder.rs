//! Fluent construction and publish-time validation of graph definitions.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use super::model::{join_id, ActionSpec, CallbackSpec, Edge, GraphDefinition, Node};
use super::{Guard, GraphError};
use crate::types::{NodeId, ParallelMode};

/// One branch of a parallel node: an ordered chain of declared state nodes.
///
/// Intra-branch edges are synthesized at build time; the last node of the
/// chain feeds the parallel node's join.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub nodes: Vec<NodeId>,
}

impl Branch {
    /// Build a branch from an ordered chain of node ids.
    pub fn chain<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
        }
    }

    /// Single-node branch.
    pub fn single(node: impl Into<NodeId>) -> Self {
        Self {
            nodes: vec![node.into()],
        }
    }
}

/// Fluent builder producing a validated [`GraphDefinition`].
///
/// ```rust
/// use waterflow::graphs::{Branch, GraphBuilder, Guard, CompareOp};
/// use waterflow::types::ParallelMode;
/// use serde_json::json;
///
/// let definition = GraphBuilder::new("demo")
///     .add_start("start")
///     .add_condition("route")
///     .add_state("big")
///     .add_state("small")
///     .add_end("end")
///     .add_edge("start", "route")
///     .add_guarded_edge("route", "big", Guard::compare("x", CompareOp::Gt, json!(10)))
///     .add_guarded_edge("route", "small", Guard::Else)
///     .add_edge("big", "end")
///     .add_edge("small", "end")
///     .build()
///     .expect("valid graph");
/// assert_eq!(definition.start_node(), "start");
/// ```
#[derive(Debug, Default)]
pub struct GraphBuilder {
    definition_id: String,
    meta_id: String,
    version: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    branches: FxHashMap<NodeId, Vec<Branch>>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(definition_id: impl Into<String>) -> Self {
        let definition_id = definition_id.into();
        Self {
            meta_id: definition_id.clone(),
            version: "1.0.0".to_string(),
            definition_id,
            nodes: Vec::new(),
            edges: Vec::new(),
            branches: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_meta(mut self, meta_id: impl Into<String>) -> Self {
        self.meta_id = meta_id.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn add_start(mut self, id: impl Into<NodeId>) -> Self {
        self.nodes.push(Node::Start { id: id.into() });
        self
    }

    #[must_use]
    pub fn add_end(mut self, id: impl Into<NodeId>) -> Self {
        self.nodes.push(Node::End { id: id.into() });
        self
    }

    /// State node with the implicit pass-through action.
    #[must_use]
    pub fn add_state(self, id: impl Into<NodeId>) -> Self {
        self.add_state_node(id, None, None, false)
    }

    /// State node invoking a declared action.
    #[must_use]
    pub fn add_action_state(self, id: impl Into<NodeId>, action: ActionSpec) -> Self {
        self.add_state_node(id, Some(action), None, false)
    }

    /// State node whose action failure fails the whole trace.
    #[must_use]
    pub fn add_critical_state(self, id: impl Into<NodeId>, action: ActionSpec) -> Self {
        self.add_state_node(id, Some(action), None, true)
    }

    /// Fully specified state node.
    #[must_use]
    pub fn add_state_node(
        mut self,
        id: impl Into<NodeId>,
        action: Option<ActionSpec>,
        callback: Option<CallbackSpec>,
        critical: bool,
    ) -> Self {
        self.nodes.push(Node::State {
            id: id.into(),
            action,
            callback,
            critical,
        });
        self
    }

    #[must_use]
    pub fn add_condition(mut self, id: impl Into<NodeId>) -> Self {
        self.nodes.push(Node::Condition { id: id.into() });
        self
    }

    /// Parallel node forking one child per branch. Edges declared *from*
    /// this node are re-homed onto its synthesized join at build time.
    #[must_use]
    pub fn add_parallel(
        mut self,
        id: impl Into<NodeId>,
        branches: Vec<Branch>,
        mode: ParallelMode,
        reducer: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let branch_heads = branches
            .iter()
            .filter_map(|b| b.nodes.first().cloned())
            .collect();
        self.branches.insert(id.clone(), branches);
        self.nodes.push(Node::Parallel {
            id,
            branch_heads,
            mode,
            reducer: reducer.into(),
        });
        self
    }

    #[must_use]
    pub fn add_edge(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    #[must_use]
    pub fn add_guarded_edge(
        mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        guard: Guard,
    ) -> Self {
        self.edges.push(Edge::guarded(from, to, guard));
        self
    }

    /// Validate and freeze the definition.
    ///
    /// Synthesizes a join node per parallel node, chains branch edges, and
    /// re-homes the parallel node's declared outgoing edges onto the join,
    /// then checks every structural rule. Any violation is fatal here so
    /// workers never meet a malformed graph.
    pub fn build(self) -> Result<GraphDefinition, GraphError> {
        let GraphBuilder {
            definition_id,
            meta_id,
            version,
            nodes: declared,
            edges: declared_edges,
            branches,
        } = self;

        let mut nodes: FxHashMap<NodeId, Node> = FxHashMap::default();
        let mut order: Vec<NodeId> = Vec::with_capacity(declared.len());
        for node in declared {
            let id = node.id().to_string();
            if nodes.insert(id.clone(), node).is_some() {
                return Err(GraphError::DuplicateNode { id });
            }
            order.push(id);
        }

        let start = find_start(&nodes, &order)?;
        let mut edges = rehome_parallel_edges(declared_edges, &branches);
        synthesize_joins(&mut nodes, &mut order, &mut edges, &branches)?;

        for edge in &edges {
            for endpoint in [&edge.from, &edge.to] {
                if !nodes.contains_key(endpoint) {
                    return Err(GraphError::UnknownNode {
                        id: endpoint.clone(),
                    });
                }
            }
        }

        check_guards(&nodes, &order, &edges)?;
        check_degrees(&nodes, &order, &edges)?;
        check_reachability(&order, &edges, &start)?;

        Ok(GraphDefinition::new(
            definition_id,
            meta_id,
            version,
            nodes,
            edges,
            start,
        ))
    }
}

fn find_start(
    nodes: &FxHashMap<NodeId, Node>,
    order: &[NodeId],
) -> Result<NodeId, GraphError> {
    let mut starts = order.iter().filter(|id| nodes[*id].is_start());
    let first = starts.next().ok_or(GraphError::MissingStart)?;
    if starts.next().is_some() {
        return Err(GraphError::MultipleStart);
    }
    Ok(first.clone())
}

/// Edges the author declared as leaving a parallel node actually leave its
/// join: the fork's only successors are its branch heads.
fn rehome_parallel_edges(
    mut edges: Vec<Edge>,
    branches: &FxHashMap<NodeId, Vec<Branch>>,
) -> Vec<Edge> {
    for edge in &mut edges {
        if branches.contains_key(&edge.from) {
            edge.from = join_id(&edge.from);
        }
    }
    edges
}

fn synthesize_joins(
    nodes: &mut FxHashMap<NodeId, Node>,
    order: &mut Vec<NodeId>,
    edges: &mut Vec<Edge>,
    branches: &FxHashMap<NodeId, Vec<Branch>>,
) -> Result<(), GraphError> {
    let mut claimed: FxHashSet<NodeId> = FxHashSet::default();

    // Deterministic iteration: follow node declaration order.
    let parallels: Vec<NodeId> = order
        .iter()
        .filter(|id| matches!(nodes.get(*id), Some(Node::Parallel { .. })))
        .cloned()
        .collect();

    for parallel_id in parallels {
        let (mode, reducer) = match &nodes[&parallel_id] {
            Node::Parallel { mode, reducer, .. } => (*mode, reducer.clone()),
            _ => unreachable!("filtered to parallel nodes"),
        };
        if reducer.is_empty() {
            return Err(GraphError::MissingReducer { id: parallel_id });
        }
        let branch_list = &branches[&parallel_id];
        if branch_list.is_empty() {
            return Err(GraphError::NoBranches { id: parallel_id });
        }

        let join = join_id(&parallel_id);
        for branch in branch_list {
            if branch.nodes.is_empty() {
                return Err(GraphError::EmptyBranch { id: parallel_id });
            }
            for member in &branch.nodes {
                match nodes.get(member) {
                    Some(Node::State { .. }) => {}
                    _ => {
                        return Err(GraphError::InvalidBranchNode {
                            parallel: parallel_id,
                            id: member.clone(),
                        })
                    }
                }
                if !claimed.insert(member.clone()) {
                    return Err(GraphError::SharedBranchNode {
                        id: member.clone(),
                    });
                }
            }

            edges.push(Edge::new(parallel_id.clone(), branch.nodes[0].clone()));
            for pair in branch.nodes.windows(2) {
                edges.push(Edge::new(pair[0].clone(), pair[1].clone()));
            }
            let last = branch.nodes.last().cloned().unwrap_or_default();
            edges.push(Edge::new(last, join.clone()));
        }

        nodes.insert(
            join.clone(),
            Node::Join {
                id: join.clone(),
                parallel: parallel_id,
                mode,
                reducer,
            },
        );
        order.push(join);
    }
    Ok(())
}

fn check_guards(
    nodes: &FxHashMap<NodeId, Node>,
    order: &[NodeId],
    edges: &[Edge],
) -> Result<(), GraphError> {
    for id in order {
        let node = &nodes[id];
        let outgoing: Vec<&Edge> = edges.iter().filter(|e| &e.from == id).collect();

        if node.is_condition() {
            let mut else_count = 0usize;
            let mut guards: Vec<&Guard> = Vec::new();
            for edge in &outgoing {
                match &edge.guard {
                    None => {
                        return Err(GraphError::UnguardedConditionEdge {
                            node: id.clone(),
                            to: edge.to.clone(),
                        })
                    }
                    Some(Guard::Else) => else_count += 1,
                    Some(guard) => {
                        if guards.contains(&guard) {
                            return Err(GraphError::DuplicateGuard { node: id.clone() });
                        }
                        guards.push(guard);
                    }
                }
            }
            match else_count {
                0 => return Err(GraphError::MissingElseEdge { node: id.clone() }),
                1 => {}
                _ => return Err(GraphError::MultipleElseEdges { node: id.clone() }),
            }
        } else if outgoing.iter().any(|e| e.guard.is_some()) {
            return Err(GraphError::GuardOutsideCondition { node: id.clone() });
        }
    }
    Ok(())
}

fn check_degrees(
    nodes: &FxHashMap<NodeId, Node>,
    order: &[NodeId],
    edges: &[Edge],
) -> Result<(), GraphError> {
    for id in order {
        let node = &nodes[id];
        if !node.is_start() && !edges.iter().any(|e| &e.to == id) {
            return Err(GraphError::NoInbound { id: id.clone() });
        }
        if !node.is_end() && !edges.iter().any(|e| &e.from == id) {
            return Err(GraphError::NoOutbound { id: id.clone() });
        }
    }
    Ok(())
}

fn check_reachability(order: &[NodeId], edges: &[Edge], start: &NodeId) -> Result<(), GraphError> {
    let mut reached: FxHashSet<&NodeId> = FxHashSet::default();
    let mut frontier = vec![start];
    reached.insert(start);
    while let Some(id) = frontier.pop() {
        for edge in edges.iter().filter(|e| &e.from == id) {
            if reached.insert(&edge.to) {
                frontier.push(&edge.to);
            }
        }
    }
    for id in order {
        if !reached.contains(id) {
            return Err(GraphError::Unreachable { id: id.clone() });
        }
    }
    Ok(())
}
