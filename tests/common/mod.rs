#![allow(dead_code)]

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use waterflow::capability::{ActionFailure, ActionHandler, CapabilityRegistry};
use waterflow::graphs::{ActionSpec, Branch, CompareOp, GraphBuilder, GraphDefinition, Guard};
use waterflow::reducers::{FnReducer, JoinReducer, ReducerRegistry};
use waterflow::runtimes::{EngineConfig, FlowEngine};
use waterflow::stores::TokenStore;
use waterflow::types::ParallelMode;
use waterflow::utils::json_ext::deep_merge;

/// Action that deep-merges its declared params into the payload.
pub struct MergeParamsAction;

#[async_trait]
impl ActionHandler for MergeParamsAction {
    async fn execute(&self, spec: &ActionSpec, data: Value) -> Result<Value, ActionFailure> {
        let params = match spec {
            ActionSpec::General { params, .. }
            | ActionSpec::Script { params, .. }
            | ActionSpec::Store { params, .. }
            | ActionSpec::Genericable { params, .. } => params.clone(),
            ActionSpec::Echo => FxHashMap::default(),
        };
        let overlay = Value::Object(params.into_iter().collect());
        Ok(deep_merge(&data, &overlay))
    }
}

/// Action that always fails.
pub struct FailingAction {
    pub message: &'static str,
}

#[async_trait]
impl ActionHandler for FailingAction {
    async fn execute(&self, _spec: &ActionSpec, _data: Value) -> Result<Value, ActionFailure> {
        Err(ActionFailure::new(self.message))
    }
}

/// Action that sleeps before passing the payload through.
pub struct SlowAction {
    pub delay_ms: u64,
}

#[async_trait]
impl ActionHandler for SlowAction {
    async fn execute(&self, _spec: &ActionSpec, data: Value) -> Result<Value, ActionFailure> {
        sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(data)
    }
}

/// `General` action spec whose params are merged by [`MergeParamsAction`].
pub fn set_params(fields: &[(&str, Value)]) -> ActionSpec {
    let mut params = FxHashMap::default();
    for (key, value) in fields {
        params.insert((*key).to_string(), value.clone());
    }
    ActionSpec::General {
        name: "set".to_string(),
        fitable: "test.set".to_string(),
        params,
    }
}

/// Reducer summing the `part` field of every arrival into `{"y": sum}`.
pub fn sum_reducer() -> Arc<dyn JoinReducer> {
    Arc::new(FnReducer::new(|tokens: &[waterflow::Token]| {
        let sum: f64 = tokens
            .iter()
            .filter_map(|t| t.data.get("part").and_then(Value::as_f64))
            .sum();
        json!({ "y": sum })
    }))
}

pub fn base_capabilities() -> CapabilityRegistry {
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register_action("general", Arc::new(MergeParamsAction));
    capabilities
}

pub fn base_reducers() -> ReducerRegistry {
    let mut reducers = ReducerRegistry::new();
    reducers.register("sum", sum_reducer());
    reducers
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        rescan_interval: Duration::from_millis(50),
        action_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

/// Engine with the shared test capabilities and reducers installed.
pub fn test_engine(store: Arc<dyn TokenStore>) -> FlowEngine {
    FlowEngine::builder(store)
        .with_config(fast_config())
        .with_capabilities(base_capabilities())
        .with_reducers(base_reducers())
        .build()
}

/// `start → work → end` with the implicit pass-through action.
pub fn linear_graph(id: &str) -> GraphDefinition {
    GraphBuilder::new(id)
        .add_start("start")
        .add_state("work")
        .add_end("end")
        .add_edge("start", "work")
        .add_edge("work", "end")
        .build()
        .expect("linear graph is valid")
}

/// `start → route`, `x > 0` to `a`, else to `b`, both into `end`.
pub fn condition_graph(id: &str) -> GraphDefinition {
    GraphBuilder::new(id)
        .add_start("start")
        .add_condition("route")
        .add_state("a")
        .add_state("b")
        .add_end("end")
        .add_edge("start", "route")
        .add_guarded_edge("route", "a", Guard::compare("x", CompareOp::Gt, json!(0)))
        .add_guarded_edge("route", "b", Guard::Else)
        .add_edge("a", "end")
        .add_edge("b", "end")
        .build()
        .expect("condition graph is valid")
}

/// `start → gather(b1 | b2) → end`, branches contributing `part` 2 and 3
/// and the `sum` reducer folding them into `y`.
pub fn fork_join_graph(id: &str, mode: ParallelMode) -> GraphDefinition {
    GraphBuilder::new(id)
        .add_start("start")
        .add_action_state("b1", set_params(&[("part", json!(2))]))
        .add_action_state("b2", set_params(&[("part", json!(3))]))
        .add_parallel(
            "gather",
            vec![Branch::single("b1"), Branch::single("b2")],
            mode,
            "sum",
        )
        .add_end("end")
        .add_edge("start", "gather")
        .add_edge("gather", "end")
        .build()
        .expect("fork/join graph is valid")
}
