//! Reactive processor network.
//!
//! Each node of a running stream gets a [`Processor`]. Tokens move through
//! the network in push style under credit-based flow control: an upstream
//! processor delivers to a [`Downstream`] only while its [`Subscription`]
//! has credit, and awaits otherwise. Persistence always comes first: a
//! processor claims its input token, persists the successors `Pending`,
//! and only then notifies and pushes — so the in-process push is pure
//! liveness and a crash at any point is recoverable from the store.
//!
//! Processors are created per stream by a [`ProcessorRegistry`], built on
//! first use; there is no process-wide processor state.

mod fork;
mod join;
mod processor;
mod registry;
mod subscription;

pub use processor::{ErrorHook, Processor};
pub use registry::{ProcessorEnv, ProcessorRegistry};
pub use subscription::{Downstream, Subscription};

use miette::Diagnostic;
use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::stores::StoreError;

/// Infrastructure failures inside a processor.
///
/// Action failures are *not* errors at this level: they are recorded on
/// the token and isolated to it. This enum covers the store and
/// coordination layer breaking underneath the processor.
#[derive(Debug, Error, Diagnostic)]
pub enum ProcessorError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Coordination(#[from] CoordinationError),
}
