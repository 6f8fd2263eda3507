//! Engine runtime: public API and worker loop.
//!
//! [`FlowEngine`] is the embedding surface of the crate: publish
//! definitions, submit work, signal waiting tokens, cancel streams, and
//! observe traces. Behind it, a pool of workers reacts to wakeups and
//! periodically rescans the store for pending tokens, which is also the
//! entire crash-recovery story: a fresh engine pointed at the same store
//! resumes mid-flight traces with no extra protocol.

mod config;
mod engine;
mod worker;

pub use config::EngineConfig;
pub use engine::{FlowEngine, FlowEngineBuilder, Submission, TraceReport};

use miette::Diagnostic;
use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::processors::ProcessorError;
use crate::stores::StoreError;

/// Engine-level failures.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("No published definition with id '{definition_id}'")]
    #[diagnostic(code(waterflow::runtimes::definition_not_found))]
    DefinitionNotFound { definition_id: String },

    #[error("No stream with id '{stream_id}'")]
    #[diagnostic(code(waterflow::runtimes::stream_not_found))]
    StreamNotFound { stream_id: String },

    #[error("No trace with id '{trace_id}'")]
    #[diagnostic(code(waterflow::runtimes::trace_not_found))]
    TraceNotFound { trace_id: String },

    #[error("No token with context id '{context_id}'")]
    #[diagnostic(code(waterflow::runtimes::token_not_found))]
    TokenNotFound { context_id: String },

    #[error("Stream '{stream_id}' holds pending tokens at position '{position_id}', which is not in its definition")]
    #[diagnostic(
        code(waterflow::runtimes::corrupt_state),
        help("the trace has been frozen; inspect the store and the published definition version")
    )]
    CorruptState {
        stream_id: String,
        position_id: String,
    },

    #[error("Trace '{trace_id}' did not reach a terminal status in time")]
    #[diagnostic(code(waterflow::runtimes::wait_timeout))]
    WaitTimeout { trace_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Processor(#[from] ProcessorError),
}
