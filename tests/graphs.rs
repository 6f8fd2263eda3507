mod common;

use serde_json::json;
use waterflow::graphs::{
    Branch, CompareOp, GraphBuilder, GraphError, Guard, Node,
};
use waterflow::types::ParallelMode;

#[test]
fn linear_graph_builds_and_exposes_structure() {
    let definition = common::linear_graph("linear");
    assert_eq!(definition.start_node(), "start");
    assert!(definition.contains("work"));
    let targets: Vec<&str> = definition
        .out_edges("start")
        .map(|e| e.to.as_str())
        .collect();
    assert_eq!(targets, vec!["work"]);
    assert_eq!(definition.out_edges("end").count(), 0);
}

#[test]
fn duplicate_node_id_is_rejected() {
    let err = GraphBuilder::new("dup")
        .add_start("start")
        .add_state("work")
        .add_state("work")
        .add_end("end")
        .add_edge("start", "work")
        .add_edge("work", "end")
        .build()
        .unwrap_err();
    assert!(matches!(err, GraphError::DuplicateNode { id } if id == "work"));
}

#[test]
fn missing_start_is_rejected() {
    let err = GraphBuilder::new("no-start")
        .add_state("work")
        .add_end("end")
        .add_edge("work", "end")
        .build()
        .unwrap_err();
    assert!(matches!(err, GraphError::MissingStart));
}

#[test]
fn second_start_is_rejected() {
    let err = GraphBuilder::new("two-starts")
        .add_start("s1")
        .add_start("s2")
        .add_end("end")
        .add_edge("s1", "end")
        .add_edge("s2", "end")
        .build()
        .unwrap_err();
    assert!(matches!(err, GraphError::MultipleStart));
}

#[test]
fn unknown_edge_endpoint_is_rejected() {
    let err = GraphBuilder::new("dangling")
        .add_start("start")
        .add_end("end")
        .add_edge("start", "missing")
        .add_edge("start", "end")
        .build()
        .unwrap_err();
    assert!(matches!(err, GraphError::UnknownNode { id } if id == "missing"));
}

#[test]
fn condition_requires_guards_on_every_edge() {
    let err = GraphBuilder::new("unguarded")
        .add_start("start")
        .add_condition("route")
        .add_end("end")
        .add_edge("start", "route")
        .add_edge("route", "end")
        .build()
        .unwrap_err();
    assert!(matches!(err, GraphError::UnguardedConditionEdge { node, .. } if node == "route"));
}

#[test]
fn condition_requires_exactly_one_else() {
    let missing = GraphBuilder::new("no-else")
        .add_start("start")
        .add_condition("route")
        .add_end("end")
        .add_edge("start", "route")
        .add_guarded_edge("route", "end", Guard::compare("x", CompareOp::Gt, json!(0)))
        .build()
        .unwrap_err();
    assert!(matches!(missing, GraphError::MissingElseEdge { node } if node == "route"));

    let doubled = GraphBuilder::new("two-else")
        .add_start("start")
        .add_condition("route")
        .add_state("a")
        .add_end("end")
        .add_edge("start", "route")
        .add_guarded_edge("route", "a", Guard::Else)
        .add_guarded_edge("route", "end", Guard::Else)
        .add_edge("a", "end")
        .build()
        .unwrap_err();
    assert!(matches!(doubled, GraphError::MultipleElseEdges { node } if node == "route"));
}

#[test]
fn syntactically_duplicate_guards_are_rejected() {
    let guard = Guard::compare("x", CompareOp::Eq, json!(1));
    let err = GraphBuilder::new("dup-guard")
        .add_start("start")
        .add_condition("route")
        .add_state("a")
        .add_state("b")
        .add_end("end")
        .add_edge("start", "route")
        .add_guarded_edge("route", "a", guard.clone())
        .add_guarded_edge("route", "b", guard)
        .add_guarded_edge("route", "end", Guard::Else)
        .add_edge("a", "end")
        .add_edge("b", "end")
        .build()
        .unwrap_err();
    assert!(matches!(err, GraphError::DuplicateGuard { node } if node == "route"));
}

#[test]
fn guard_outside_condition_is_rejected() {
    let err = GraphBuilder::new("stray-guard")
        .add_start("start")
        .add_state("work")
        .add_end("end")
        .add_guarded_edge("start", "work", Guard::exists("x"))
        .add_edge("work", "end")
        .build()
        .unwrap_err();
    assert!(matches!(err, GraphError::GuardOutsideCondition { node } if node == "start"));
}

#[test]
fn unreachable_node_is_rejected() {
    let err = GraphBuilder::new("island")
        .add_start("start")
        .add_state("work")
        .add_state("island")
        .add_end("end")
        .add_edge("start", "work")
        .add_edge("work", "end")
        .add_edge("island", "island")
        .build()
        .unwrap_err();
    // The self-referencing island fails degree or reachability checks.
    assert!(matches!(
        err,
        GraphError::Unreachable { .. } | GraphError::NoInbound { .. }
    ));
}

#[test]
fn parallel_synthesizes_join_and_rehomes_edges() {
    let definition = common::fork_join_graph("fork", ParallelMode::All);

    // The fork's successors are its branch heads.
    let mut fork_targets: Vec<&str> = definition
        .out_edges("gather")
        .map(|e| e.to.as_str())
        .collect();
    fork_targets.sort_unstable();
    assert_eq!(fork_targets, vec!["b1", "b2"]);

    // Branch tails feed the synthesized join; the author's gather→end edge
    // now leaves the join.
    let join = definition.node("gather__join").expect("join synthesized");
    assert!(matches!(
        join,
        Node::Join { parallel, mode, .. } if parallel == "gather" && *mode == ParallelMode::All
    ));
    let b1_targets: Vec<&str> = definition.out_edges("b1").map(|e| e.to.as_str()).collect();
    assert_eq!(b1_targets, vec!["gather__join"]);
    let join_targets: Vec<&str> = definition
        .out_edges("gather__join")
        .map(|e| e.to.as_str())
        .collect();
    assert_eq!(join_targets, vec!["end"]);
}

#[test]
fn branch_nodes_must_be_declared_states() {
    let err = GraphBuilder::new("bad-branch")
        .add_start("start")
        .add_condition("c")
        .add_parallel(
            "gather",
            vec![Branch::single("c")],
            ParallelMode::All,
            "merge",
        )
        .add_end("end")
        .add_edge("start", "gather")
        .add_edge("gather", "end")
        .build()
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidBranchNode { id, .. } if id == "c"));
}

#[test]
fn branch_node_cannot_belong_to_two_branches() {
    let err = GraphBuilder::new("shared-branch")
        .add_start("start")
        .add_state("b1")
        .add_parallel(
            "gather",
            vec![Branch::single("b1"), Branch::single("b1")],
            ParallelMode::All,
            "merge",
        )
        .add_end("end")
        .add_edge("start", "gather")
        .add_edge("gather", "end")
        .build()
        .unwrap_err();
    assert!(matches!(err, GraphError::SharedBranchNode { id } if id == "b1"));
}

#[test]
fn parallel_requires_branches_and_reducer() {
    let empty = GraphBuilder::new("no-branches")
        .add_start("start")
        .add_parallel("gather", vec![], ParallelMode::All, "merge")
        .add_end("end")
        .add_edge("start", "gather")
        .add_edge("gather", "end")
        .build()
        .unwrap_err();
    assert!(matches!(empty, GraphError::NoBranches { id } if id == "gather"));

    let unnamed = GraphBuilder::new("no-reducer")
        .add_start("start")
        .add_state("b1")
        .add_parallel("gather", vec![Branch::single("b1")], ParallelMode::All, "")
        .add_end("end")
        .add_edge("start", "gather")
        .add_edge("gather", "end")
        .build()
        .unwrap_err();
    assert!(matches!(unnamed, GraphError::MissingReducer { id } if id == "gather"));
}

#[test]
fn multi_node_branch_chains_in_order() {
    let definition = GraphBuilder::new("chain")
        .add_start("start")
        .add_state("b1a")
        .add_state("b1b")
        .add_state("b2")
        .add_parallel(
            "gather",
            vec![Branch::chain(["b1a", "b1b"]), Branch::single("b2")],
            ParallelMode::All,
            "merge",
        )
        .add_end("end")
        .add_edge("start", "gather")
        .add_edge("gather", "end")
        .build()
        .expect("chain graph is valid");

    let b1a_targets: Vec<&str> = definition.out_edges("b1a").map(|e| e.to.as_str()).collect();
    assert_eq!(b1a_targets, vec!["b1b"]);
    let b1b_targets: Vec<&str> = definition.out_edges("b1b").map(|e| e.to.as_str()).collect();
    assert_eq!(b1b_targets, vec!["gather__join"]);
}
