//! Per-node processor: claim, execute, persist, notify, push.

use futures_util::future::{join_all, BoxFuture};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::subscription::Downstream;
use super::ProcessorError;
use crate::capability::{ActionError, ActionFailure, CapabilityRegistry};
use crate::coordination::{LockKey, LockService, WakeupHub};
use crate::graphs::{ActionSpec, CallbackSpec, GraphDefinition, Node};
use crate::reducers::ReducerRegistry;
use crate::stores::TokenStore;
use crate::token::{Token, TokenFailure};
use crate::types::{NodeId, TokenStatus, TraceStatus};
use crate::utils::json_ext::{get_by_path, set_by_path};

/// Observer invoked with every action error the node records.
pub type ErrorHook = Arc<dyn Fn(&ActionError) + Send + Sync>;

/// Everything a stream's processors share.
pub(crate) struct StreamContext {
    pub stream_id: String,
    pub trace_id: String,
    pub definition: Arc<GraphDefinition>,
    pub store: Arc<dyn TokenStore>,
    pub locks: Arc<dyn LockService>,
    pub hub: WakeupHub,
    pub capabilities: Arc<CapabilityRegistry>,
    pub reducers: Arc<ReducerRegistry>,
    pub action_timeout: Duration,
}

/// Processor of one node within one stream.
///
/// [`on_next`](Processor::on_next) is the single entry point for every
/// delivery plane — worker rescan, wakeup handling, and in-process pushes
/// all converge here, and the atomic token claim inside makes duplicate
/// deliveries no-ops.
pub struct Processor {
    node: Node,
    ctx: Arc<StreamContext>,
    downstreams: RwLock<FxHashMap<NodeId, Downstream>>,
    error_hook: RwLock<Option<ErrorHook>>,
}

impl Processor {
    pub(crate) fn new(node: Node, ctx: Arc<StreamContext>) -> Self {
        Self {
            node,
            ctx,
            downstreams: RwLock::new(FxHashMap::default()),
            error_hook: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Wire a downstream link for one successor position.
    pub fn subscribe(&self, position_id: NodeId, downstream: Downstream) {
        self.downstreams
            .write()
            .expect("downstream table poisoned")
            .insert(position_id, downstream);
    }

    /// Register the node-local error observer.
    pub fn on_error(&self, hook: ErrorHook) {
        *self.error_hook.write().expect("error hook poisoned") = Some(hook);
    }

    /// Cancel every downstream subscription of this processor.
    pub fn cancel_subscriptions(&self) {
        let downstreams = self.downstreams.read().expect("downstream table poisoned");
        for downstream in downstreams.values() {
            downstream.subscription().cancel();
        }
    }

    /// Consume one token delivery.
    ///
    /// Claims the token (a non-pending token is skipped silently), runs the
    /// node's behavior under the position lock, persists the successor
    /// tokens, then notifies and pushes outside the lock. Boxed because
    /// in-process pushes recurse through downstream processors.
    pub fn on_next(self: &Arc<Self>, token: Token) -> BoxFuture<'static, Result<(), ProcessorError>> {
        let this = Arc::clone(self);
        Box::pin(async move { this.process(token).await })
    }

    #[instrument(
        skip(self, token),
        fields(node = %self.node.id(), context_id = %token.context_id)
    )]
    async fn process(self: Arc<Self>, token: Token) -> Result<(), ProcessorError> {
        let key = LockKey::position(&self.ctx.stream_id, self.node.id());
        let successors = {
            let _guard = self.ctx.locks.lock(&key).await?;
            if !self.ctx.store.claim(&token.context_id).await? {
                debug!("token not pending; duplicate delivery skipped");
                return Ok(());
            }
            // Reload: an external signal may have merged data since the
            // notification that carried this token was produced.
            let token = match self.ctx.store.find(&token.context_id).await? {
                Some(current) => current,
                None => token,
            };
            self.handle(token).await?
        };
        self.dispatch(successors).await
    }

    async fn handle(&self, token: Token) -> Result<Vec<Token>, ProcessorError> {
        match &self.node {
            Node::Start { .. } => {
                let data = token.data.clone();
                self.forward_all(&token, data).await
            }
            Node::State {
                action,
                callback,
                critical,
                ..
            } => self.run_state(token, action, callback, *critical).await,
            Node::Condition { .. } => self.route(token).await,
            Node::End { .. } => {
                self.ctx.store.archive(&token.context_id).await?;
                info!("token archived at end node");
                self.finalize_trace_if_done().await?;
                Ok(Vec::new())
            }
            Node::Parallel {
                branch_heads, mode, ..
            } => self.fork(token, branch_heads, *mode).await,
            Node::Join {
                parallel,
                mode,
                reducer,
                ..
            } => self.aggregate(token, parallel, *mode, reducer).await,
        }
    }

    async fn run_state(
        &self,
        token: Token,
        action: &Option<ActionSpec>,
        callback: &Option<CallbackSpec>,
        critical: bool,
    ) -> Result<Vec<Token>, ProcessorError> {
        let spec = action.clone().unwrap_or(ActionSpec::Echo);
        let operation = spec.operation();

        let output = match self.ctx.capabilities.action(operation) {
            None => Err(ActionFailure::new(format!(
                "no handler registered for operation '{operation}'"
            ))),
            Some(handler) => {
                match timeout(
                    self.ctx.action_timeout,
                    handler.execute(&spec, token.data.clone()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ActionFailure::new(format!(
                        "action timed out after {:?}",
                        self.ctx.action_timeout
                    ))),
                }
            }
        };

        match output {
            Ok(data) => {
                self.fire_callback(callback, &data);
                self.forward_all(&token, data).await
            }
            Err(failure) => {
                self.fail_token(&token, "action", operation, &failure.message, critical)
                    .await?;
                Ok(Vec::new())
            }
        }
    }

    async fn route(&self, token: Token) -> Result<Vec<Token>, ProcessorError> {
        let edges: Vec<_> = self.ctx.definition.out_edges(self.node.id()).collect();
        let chosen = edges
            .iter()
            .find(|e| matches!(&e.guard, Some(g) if !g.is_else() && g.matches(&token.data)))
            .or_else(|| {
                edges
                    .iter()
                    .find(|e| matches!(&e.guard, Some(g) if g.is_else()))
            })
            .map(|e| e.to.clone());

        match chosen {
            Some(target) => {
                let data = token.data.clone();
                self.persist_successors(&token, data, &[target]).await
            }
            None => {
                // Unreachable after validation; recorded instead of panicking.
                self.fail_token(&token, "route", "condition", "no edge matched", false)
                    .await?;
                Ok(Vec::new())
            }
        }
    }

    /// Fan out to every successor position.
    pub(crate) async fn forward_all(
        &self,
        token: &Token,
        data: Value,
    ) -> Result<Vec<Token>, ProcessorError> {
        let targets: Vec<NodeId> = self
            .ctx
            .definition
            .out_edges(self.node.id())
            .map(|e| e.to.clone())
            .collect();
        self.persist_successors(token, data, &targets).await
    }

    /// Persist successors `Pending` and archive the consumed token as one
    /// atomic store transition. A crash leaves the token either still
    /// claimed (released back to `Pending` once its lease expires) or fully
    /// advanced, never half-way.
    pub(crate) async fn persist_successors(
        &self,
        token: &Token,
        data: Value,
        targets: &[NodeId],
    ) -> Result<Vec<Token>, ProcessorError> {
        let successors: Vec<Token> = targets
            .iter()
            .map(|target| token.derive(target.clone(), data.clone()))
            .collect();
        let successors = self
            .ctx
            .store
            .save_all_and_archive(&successors, &token.context_id)
            .await?;
        Ok(successors)
    }

    /// Notify and push successors. Runs outside the position lock so a
    /// slow or credit-starved downstream never blocks this position.
    pub(crate) async fn dispatch(&self, successors: Vec<Token>) -> Result<(), ProcessorError> {
        for successor in &successors {
            self.ctx
                .hub
                .notify(successor.stream_id.clone(), successor.position_id.clone());
            self.ctx.store.mark_sent(&successor.context_id).await?;
        }

        let deliveries: Vec<(Downstream, Token)> = {
            let downstreams = self.downstreams.read().expect("downstream table poisoned");
            successors
                .into_iter()
                .filter_map(|s| downstreams.get(&s.position_id).cloned().map(|d| (d, s)))
                .collect()
        };

        let results = join_all(deliveries.into_iter().map(|(downstream, token)| async move {
            let context_id = token.context_id.clone();
            (context_id, downstream.deliver(token).await)
        }))
        .await;

        for (context_id, result) in results {
            if let Err(err) = result {
                warn!(
                    context_id = %context_id,
                    error = %err,
                    "in-process delivery failed; pending work stays in the store"
                );
            }
        }
        Ok(())
    }

    fn fire_callback(&self, callback: &Option<CallbackSpec>, data: &Value) {
        let Some(spec) = callback else { return };
        let Some(handler) = self.ctx.capabilities.callback(&spec.name) else {
            warn!(callback = %spec.name, "no callback handler registered");
            return;
        };
        let spec = spec.clone();
        let payload = filter_payload(data, &spec.filtered_keys);
        tokio::spawn(async move {
            if let Err(err) = handler.on_complete(&spec, &payload).await {
                warn!(callback = %spec.name, error = %err, "callback failed");
            }
        });
    }

    /// Record an action failure on the token. Node-level isolation: the
    /// trace and sibling branches continue unless the node is critical.
    pub(crate) async fn fail_token(
        &self,
        token: &Token,
        kind: &str,
        operation: &str,
        message: &str,
        critical: bool,
    ) -> Result<(), ProcessorError> {
        let failure = TokenFailure::new(self.node.id(), kind, message);
        self.ctx
            .store
            .record_error(&token.context_id, &failure)
            .await?;

        let error = ActionError {
            node_id: self.node.id().to_string(),
            node_kind: self.node.kind().to_string(),
            operation: operation.to_string(),
            message: message.to_string(),
        };
        warn!(operation = %operation, error = %message, critical, "node action failed");
        let hook = self.error_hook.read().expect("error hook poisoned").clone();
        if let Some(hook) = hook {
            hook(&error);
        }

        if critical {
            self.ctx
                .store
                .cancel_stream_tokens(&self.ctx.stream_id)
                .await?;
            self.ctx
                .store
                .update_trace_status(&self.ctx.trace_id, TraceStatus::Failed)
                .await?;
        } else {
            self.finalize_trace_if_done().await?;
        }
        Ok(())
    }

    /// Close the trace once no live tokens remain: `Failed` when any token
    /// errored, `Completed` otherwise.
    pub(crate) async fn finalize_trace_if_done(&self) -> Result<(), ProcessorError> {
        let Some(trace) = self.ctx.store.trace(&self.ctx.trace_id).await? else {
            return Ok(());
        };
        if trace.status.is_terminal() {
            return Ok(());
        }
        let tokens = self.ctx.store.find_by_trace(&self.ctx.trace_id).await?;
        if tokens.iter().any(|t| t.status.is_live()) {
            return Ok(());
        }
        let status = if tokens.iter().any(|t| t.status == TokenStatus::Error) {
            TraceStatus::Failed
        } else {
            TraceStatus::Completed
        };
        self.ctx
            .store
            .update_trace_status(&self.ctx.trace_id, status)
            .await?;
        info!(trace_id = %self.ctx.trace_id, status = %status, "trace finished");
        Ok(())
    }

    pub(crate) fn ctx(&self) -> &Arc<StreamContext> {
        &self.ctx
    }
}

/// Narrow a payload to the callback's filtered keys (dot-paths); an empty
/// key set passes the full payload.
fn filter_payload(data: &Value, keys: &[String]) -> Value {
    if keys.is_empty() {
        return data.clone();
    }
    let mut out = Value::Object(Map::new());
    for key in keys {
        if let Some(value) = get_by_path(data, key) {
            let _ = set_by_path(&mut out, key, value.clone());
        }
    }
    out
}
