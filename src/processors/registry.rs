//! Per-stream processor registry.

use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::processor::{Processor, StreamContext};
use super::subscription::{Downstream, Subscription};
use crate::capability::CapabilityRegistry;
use crate::coordination::{LockService, WakeupHub};
use crate::graphs::GraphDefinition;
use crate::reducers::ReducerRegistry;
use crate::stores::TokenStore;
use crate::types::NodeId;

/// Shared services a processor network is built from.
#[derive(Clone)]
pub struct ProcessorEnv {
    pub store: Arc<dyn TokenStore>,
    pub locks: Arc<dyn LockService>,
    pub hub: WakeupHub,
    pub capabilities: Arc<CapabilityRegistry>,
    pub reducers: Arc<ReducerRegistry>,
    /// Budget for one action execution.
    pub action_timeout: Duration,
    /// Initial credit granted on every wired downstream link.
    pub initial_credit: u64,
}

/// Processors of one stream, keyed by node id and built on first use.
///
/// Scoped to the stream: two streams of the same definition get disjoint
/// processor networks, and dropping the registry drops the network.
pub struct ProcessorRegistry {
    ctx: Arc<StreamContext>,
    initial_credit: u64,
    processors: Mutex<FxHashMap<NodeId, Arc<Processor>>>,
}

impl ProcessorRegistry {
    #[must_use]
    pub fn new(
        stream_id: impl Into<String>,
        trace_id: impl Into<String>,
        definition: Arc<GraphDefinition>,
        env: ProcessorEnv,
    ) -> Self {
        let ctx = Arc::new(StreamContext {
            stream_id: stream_id.into(),
            trace_id: trace_id.into(),
            definition,
            store: env.store,
            locks: env.locks,
            hub: env.hub,
            capabilities: env.capabilities,
            reducers: env.reducers,
            action_timeout: env.action_timeout,
        });
        Self {
            ctx,
            initial_credit: env.initial_credit,
            processors: Mutex::new(FxHashMap::default()),
        }
    }

    /// Processor for a node, creating and wiring the reachable part of the
    /// network on first use. Returns `None` for positions not in the
    /// definition (corrupt persisted state).
    #[must_use]
    pub fn processor(&self, node_id: &str) -> Option<Arc<Processor>> {
        if !self.ctx.definition.contains(node_id) {
            return None;
        }
        let mut processors = self.processors.lock().expect("processor table poisoned");
        if let Some(existing) = processors.get(node_id) {
            return Some(Arc::clone(existing));
        }

        // First pass: create bare processors for everything reachable.
        // Second pass: wire downstream links. Split so cyclic graphs wire
        // without recursion.
        let mut created: Vec<NodeId> = Vec::new();
        let mut stack: Vec<NodeId> = vec![node_id.to_string()];
        while let Some(id) = stack.pop() {
            if processors.contains_key(&id) {
                continue;
            }
            let node = self
                .ctx
                .definition
                .node(&id)
                .expect("validated edges only reference declared nodes")
                .clone();
            processors.insert(
                id.clone(),
                Arc::new(Processor::new(node, Arc::clone(&self.ctx))),
            );
            created.push(id.clone());
            for edge in self.ctx.definition.out_edges(&id) {
                stack.push(edge.to.clone());
            }
        }

        for id in &created {
            let processor = Arc::clone(&processors[id]);
            for edge in self.ctx.definition.out_edges(id) {
                let target = Arc::clone(&processors[&edge.to]);
                let subscription = Arc::new(Subscription::new());
                subscription.request(self.initial_credit);
                processor.subscribe(
                    edge.to.clone(),
                    Downstream::replenishing(target, subscription),
                );
            }
        }

        processors.get(node_id).cloned()
    }

    /// Cancel every live subscription in the network.
    pub fn cancel_all(&self) {
        let processors = self.processors.lock().expect("processor table poisoned");
        for processor in processors.values() {
            processor.cancel_subscriptions();
        }
    }
}
