//! The flow engine: the crate's embedding surface.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::worker::run_worker;
use super::{EngineConfig, EngineError};
use crate::capability::CapabilityRegistry;
use crate::coordination::{LocalLockService, LockService, WakeupHub};
use crate::graphs::{DefinitionRegistry, GraphDefinition};
use crate::processors::{ProcessorEnv, ProcessorRegistry};
use crate::reducers::ReducerRegistry;
use crate::stores::TokenStore;
use crate::token::{StreamRecord, Token, TokenFailure, Trace};
use crate::types::{TokenStatus, TraceStatus};
use crate::utils::json_ext::deep_merge;

/// Handle returned by [`FlowEngine::submit`].
#[derive(Clone, Debug)]
pub struct Submission {
    pub trace_id: String,
    pub stream_id: String,
    /// Context id of the root token.
    pub context_id: String,
}

/// Observable outcome of a trace.
#[derive(Clone, Debug)]
pub struct TraceReport {
    pub trace_id: String,
    pub status: TraceStatus,
    /// First unrecovered token failure, carrying the node id and kind.
    pub first_error: Option<TokenFailure>,
    pub archived: usize,
    pub errored: usize,
    pub live: usize,
}

pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub store: Arc<dyn TokenStore>,
    pub locks: Arc<dyn LockService>,
    pub hub: WakeupHub,
    pub capabilities: Arc<CapabilityRegistry>,
    pub reducers: Arc<ReducerRegistry>,
    pub definitions: DefinitionRegistry,
    pub registries: Mutex<FxHashMap<String, Arc<ProcessorRegistry>>>,
}

impl EngineInner {
    fn env(&self) -> ProcessorEnv {
        ProcessorEnv {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            hub: self.hub.clone(),
            capabilities: Arc::clone(&self.capabilities),
            reducers: Arc::clone(&self.reducers),
            action_timeout: self.config.action_timeout,
            initial_credit: self.config.initial_credit,
        }
    }

    /// Registry for a stream, built from its persisted definition binding
    /// on first use.
    pub(crate) async fn registry_for(
        &self,
        stream_id: &str,
    ) -> Result<Arc<ProcessorRegistry>, EngineError> {
        if let Some(registry) = self
            .registries
            .lock()
            .expect("registry table poisoned")
            .get(stream_id)
        {
            return Ok(Arc::clone(registry));
        }

        let stream = self.store.stream(stream_id).await?.ok_or_else(|| {
            EngineError::StreamNotFound {
                stream_id: stream_id.to_string(),
            }
        })?;
        let definition =
            self.definitions
                .resolve(&stream.definition_id)
                .ok_or(EngineError::DefinitionNotFound {
                    definition_id: stream.definition_id.clone(),
                })?;
        let registry = Arc::new(ProcessorRegistry::new(
            stream.stream_id,
            stream.trace_id,
            definition,
            self.env(),
        ));
        Ok(Arc::clone(
            self.registries
                .lock()
                .expect("registry table poisoned")
                .entry(stream_id.to_string())
                .or_insert(registry),
        ))
    }

    /// Drive every pending token at one position through its processor.
    ///
    /// A position absent from the stream's definition freezes the trace
    /// (once) and reports corrupt state; it is never auto-repaired.
    pub(crate) async fn handle_position(
        &self,
        stream_id: &str,
        position_id: &str,
    ) -> Result<(), EngineError> {
        let registry = self.registry_for(stream_id).await?;
        let Some(processor) = registry.processor(position_id) else {
            let stream = self.store.stream(stream_id).await?.ok_or_else(|| {
                EngineError::StreamNotFound {
                    stream_id: stream_id.to_string(),
                }
            })?;
            let trace = self.store.trace(&stream.trace_id).await?;
            if matches!(&trace, Some(t) if t.status == TraceStatus::Running) {
                warn!(
                    stream_id,
                    position_id,
                    trace_id = %stream.trace_id,
                    "pending token at unknown position; freezing trace"
                );
                self.store
                    .update_trace_status(&stream.trace_id, TraceStatus::Frozen)
                    .await?;
                return Err(EngineError::CorruptState {
                    stream_id: stream_id.to_string(),
                    position_id: position_id.to_string(),
                });
            }
            // Already frozen or otherwise terminal; leave the tokens alone.
            return Ok(());
        };

        let pending = self
            .store
            .find_by_position(stream_id, position_id, Some(TokenStatus::Pending))
            .await?;
        for token in pending {
            // Token-level isolation: one failed delivery must not starve
            // the rest of the position.
            let context_id = token.context_id.clone();
            if let Err(err) = processor.on_next(token).await {
                warn!(context_id = %context_id, error = %err, "token processing failed");
            }
        }
        Ok(())
    }

    /// Release claims whose holder evidently died: `Processing` tokens
    /// older than the configured lease go back to `Pending` and re-enter
    /// the worklist.
    pub(crate) async fn release_stale_claims(&self) -> Result<(), EngineError> {
        let Ok(lease) = chrono::Duration::from_std(self.config.claim_lease) else {
            // A lease too large to represent never expires.
            return Ok(());
        };
        let released = self
            .store
            .reset_stale_processing(chrono::Utc::now() - lease)
            .await?;
        if released > 0 {
            warn!(released, "released stale claims back to pending");
        }
        Ok(())
    }

    /// One full rescan pass over the pending worklist.
    pub(crate) async fn rescan(&self) -> Result<(), EngineError> {
        self.release_stale_claims().await?;
        let pending = self.store.pending_positions().await?;
        for (stream_id, position_id) in pending {
            match self.handle_position(&stream_id, &position_id).await {
                Ok(()) | Err(EngineError::CorruptState { .. }) => {}
                Err(err) => {
                    warn!(stream_id, position_id, error = %err, "rescan pass failed for position");
                }
            }
        }
        Ok(())
    }
}

/// Builder for a [`FlowEngine`] with non-default collaborators.
pub struct FlowEngineBuilder {
    store: Arc<dyn TokenStore>,
    config: EngineConfig,
    capabilities: CapabilityRegistry,
    reducers: ReducerRegistry,
    locks: Option<Arc<dyn LockService>>,
}

impl FlowEngineBuilder {
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilityRegistry) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_reducers(mut self, reducers: ReducerRegistry) -> Self {
        self.reducers = reducers;
        self
    }

    /// Replace the in-process lock service (shared-database deployments).
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = Some(locks);
        self
    }

    #[must_use]
    pub fn build(self) -> FlowEngine {
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(LocalLockService::with_timeout(self.config.lock_timeout)));
        FlowEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                store: self.store,
                locks,
                hub: WakeupHub::new(),
                capabilities: Arc::new(self.capabilities),
                reducers: Arc::new(self.reducers),
                definitions: DefinitionRegistry::new(),
                registries: Mutex::new(FxHashMap::default()),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Persistent, crash-recoverable workflow engine.
///
/// Cloning is cheap and shares the engine.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
    workers: Arc<Mutex<Vec<(JoinHandle<()>, oneshot::Sender<()>)>>>,
}

impl FlowEngine {
    /// Engine with default configuration and collaborators.
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self::builder(store).build()
    }

    /// Engine backed by the configured SQLite database.
    ///
    /// Resolves the database URL through
    /// [`EngineConfig::resolve_database_url`] (explicit override, then
    /// `WATERFLOW_DB`, then `waterflow.db`) and connects before building.
    #[cfg(feature = "sqlite")]
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        let url = config.resolve_database_url();
        let store = crate::stores::SqliteTokenStore::connect(&url).await?;
        Ok(Self::builder(Arc::new(store)).with_config(config).build())
    }

    #[must_use]
    pub fn builder(store: Arc<dyn TokenStore>) -> FlowEngineBuilder {
        FlowEngineBuilder {
            store,
            config: EngineConfig::default(),
            capabilities: CapabilityRegistry::new(),
            reducers: ReducerRegistry::new(),
            locks: None,
        }
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn TokenStore> {
        Arc::clone(&self.inner.store)
    }

    /// Publish a validated definition and index its capability usages.
    #[instrument(skip(self, definition), fields(definition_id = %definition.definition_id))]
    pub async fn publish(&self, definition: GraphDefinition) -> Result<(), EngineError> {
        let definition = self.inner.definitions.publish(definition);
        for fitable in definition.fitables() {
            self.inner
                .store
                .record_usage(fitable, &definition.definition_id)
                .await?;
        }
        info!("definition published");
        Ok(())
    }

    /// Create a trace and stream, persist the root token `Pending` at the
    /// start node, and notify the workers.
    #[instrument(skip(self, initial_data))]
    pub async fn submit(
        &self,
        definition_id: &str,
        initial_data: Value,
        operator: &str,
        application: &str,
    ) -> Result<Submission, EngineError> {
        let definition = self.inner.definitions.resolve(definition_id).ok_or_else(|| {
            EngineError::DefinitionNotFound {
                definition_id: definition_id.to_string(),
            }
        })?;

        let trace = Trace::new(operator, application, definition.start_node());
        self.inner.store.insert_trace(&trace).await?;

        let stream_id = Uuid::new_v4().to_string();
        self.inner
            .store
            .insert_stream(&StreamRecord {
                stream_id: stream_id.clone(),
                definition_id: definition_id.to_string(),
                trace_id: trace.trace_id.clone(),
                created_at: chrono::Utc::now(),
            })
            .await?;

        let token = Token::root(
            &stream_id,
            &trace.trace_id,
            definition.start_node(),
            initial_data,
        );
        let token = self.inner.store.save(&token).await?;
        self.inner
            .store
            .update_status(&token.context_id, TokenStatus::Pending)
            .await?;

        // Persisted first; the notification is pure liveness.
        self.inner
            .hub
            .notify(&stream_id, definition.start_node().to_string());
        self.inner.store.mark_sent(&token.context_id).await?;

        info!(trace_id = %trace.trace_id, stream_id = %stream_id, "submission accepted");
        Ok(Submission {
            trace_id: trace.trace_id,
            stream_id,
            context_id: token.context_id,
        })
    }

    /// Merge event data into a token's payload and re-wake its position.
    #[instrument(skip(self, event))]
    pub async fn signal(&self, context_id: &str, event: Value) -> Result<(), EngineError> {
        let token = self.inner.store.find(context_id).await?.ok_or_else(|| {
            EngineError::TokenNotFound {
                context_id: context_id.to_string(),
            }
        })?;
        let merged = deep_merge(&token.data, &event);
        self.inner.store.update_data(context_id, &merged).await?;
        self.inner
            .hub
            .notify(token.stream_id, token.position_id);
        Ok(())
    }

    /// Cancel a stream: stop its subscriptions, mark live tokens `Error`,
    /// and move its trace to `Cancelled`. Returns the number of tokens
    /// affected.
    #[instrument(skip(self))]
    pub async fn cancel_stream(&self, stream_id: &str) -> Result<u64, EngineError> {
        let stream = self.inner.store.stream(stream_id).await?.ok_or_else(|| {
            EngineError::StreamNotFound {
                stream_id: stream_id.to_string(),
            }
        })?;
        if let Some(registry) = self
            .inner
            .registries
            .lock()
            .expect("registry table poisoned")
            .get(stream_id)
        {
            registry.cancel_all();
        }
        let affected = self.inner.store.cancel_stream_tokens(stream_id).await?;
        self.inner
            .store
            .update_trace_status(&stream.trace_id, TraceStatus::Cancelled)
            .await?;
        info!(trace_id = %stream.trace_id, affected, "stream cancelled");
        Ok(affected)
    }

    /// Current status of a trace with its first unrecovered failure.
    pub async fn trace_report(&self, trace_id: &str) -> Result<TraceReport, EngineError> {
        let trace = self.inner.store.trace(trace_id).await?.ok_or_else(|| {
            EngineError::TraceNotFound {
                trace_id: trace_id.to_string(),
            }
        })?;
        let tokens = self.inner.store.find_by_trace(trace_id).await?;
        Ok(TraceReport {
            trace_id: trace_id.to_string(),
            status: trace.status,
            first_error: tokens.iter().find_map(|t| t.error.clone()),
            archived: tokens
                .iter()
                .filter(|t| t.status == TokenStatus::Archived)
                .count(),
            errored: tokens
                .iter()
                .filter(|t| t.status == TokenStatus::Error)
                .count(),
            live: tokens.iter().filter(|t| t.status.is_live()).count(),
        })
    }

    /// Poll until the trace reaches a terminal status.
    pub async fn wait_for_trace(
        &self,
        trace_id: &str,
        wait: Duration,
    ) -> Result<TraceReport, EngineError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let report = self.trace_report(trace_id).await?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::WaitTimeout {
                    trace_id: trace_id.to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Spawn the configured number of worker tasks.
    pub fn start(&self) {
        let mut workers = self.workers.lock().expect("worker table poisoned");
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.inner.config.workers {
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(run_worker(worker_id, inner, shutdown_rx));
            workers.push((handle, shutdown_tx));
        }
        info!(workers = self.inner.config.workers, "engine started");
    }

    /// Signal every worker to stop and wait for them to finish.
    pub async fn shutdown(&self) {
        let drained: Vec<(JoinHandle<()>, oneshot::Sender<()>)> = {
            let mut workers = self.workers.lock().expect("worker table poisoned");
            workers.drain(..).collect()
        };
        for (handle, shutdown) in drained {
            let _ = shutdown.send(());
            let _ = handle.await;
        }
    }

    /// Process pending work inline until the store is drained or stops
    /// making progress (frozen traces keep their pending tokens).
    ///
    /// This is the recovery path condensed into a method: called on a
    /// fresh engine over an existing store, it completes mid-flight traces
    /// exactly as the workers would, without spawning any.
    pub async fn drain(&self) -> Result<(), EngineError> {
        self.inner.release_stale_claims().await?;
        loop {
            let before = self.inner.store.pending_positions().await?;
            if before.is_empty() {
                return Ok(());
            }
            for (stream_id, position_id) in &before {
                match self.inner.handle_position(stream_id, position_id).await {
                    Ok(()) | Err(EngineError::CorruptState { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
            let after = self.inner.store.pending_positions().await?;
            if after == before {
                return Ok(());
            }
        }
    }

    /// Definitions known to reference a capability.
    pub async fn usages_for(&self, fitable: &str) -> Result<Vec<String>, EngineError> {
        Ok(self.inner.store.usages_for(fitable).await?)
    }
}
