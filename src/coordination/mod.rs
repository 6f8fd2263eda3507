//! Multi-worker coordination: scoped locks and wakeup notifications.
//!
//! Two primitives keep concurrent workers correct and live:
//!
//! - [`LockService`] grants at-most-one critical section per [`LockKey`],
//!   serializing read-pending → decide → write-result for one node
//!   position (or one join batch) at a time. Guards release on drop, so
//!   every exit path unlocks.
//! - [`WakeupHub`] carries best-effort, at-least-once wakeups. Recipients
//!   treat a wakeup purely as "look at the store again": duplicates and
//!   reordering are harmless, and a missed wakeup is healed by the
//!   workers' periodic rescan.
//!
//! The in-process implementations here serve embedded deployments; the
//! trait seam admits distributed lock services for shared-database setups.

mod local;

pub use local::LocalLockService;

use async_trait::async_trait;
use miette::Diagnostic;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Scope of one critical section.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Serializes processing of one node position within one stream.
    Position { stream: String, position: String },
    /// Serializes join decisions for one fork batch.
    JoinBatch {
        stream: String,
        parallel: String,
        batch: String,
    },
}

impl LockKey {
    pub fn position(stream: impl Into<String>, position: impl Into<String>) -> Self {
        LockKey::Position {
            stream: stream.into(),
            position: position.into(),
        }
    }

    pub fn join_batch(
        stream: impl Into<String>,
        parallel: impl Into<String>,
        batch: impl Into<String>,
    ) -> Self {
        LockKey::JoinBatch {
            stream: stream.into(),
            parallel: parallel.into(),
            batch: batch.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Position { stream, position } => write!(f, "position:{stream}:{position}"),
            LockKey::JoinBatch {
                stream,
                parallel,
                batch,
            } => write!(f, "join:{stream}:{parallel}:{batch}"),
        }
    }
}

/// Coordination failures.
///
/// These are transient by design: a worker that fails to lock or notify
/// simply leaves the pending tokens in the store, where the periodic
/// rescan picks them up.
#[derive(Debug, Error, Diagnostic)]
pub enum CoordinationError {
    #[error("Timed out acquiring lock '{key}'")]
    #[diagnostic(
        code(waterflow::coordination::lock_timeout),
        help("the holder may be stuck in a long action; pending work is retried by the rescan")
    )]
    LockTimeout { key: String },

    #[error("Wakeup channel is closed")]
    #[diagnostic(code(waterflow::coordination::hub_closed))]
    HubClosed,
}

/// RAII guard of one held lock; releases on drop.
pub struct LockGuard {
    _inner: Box<dyn Any + Send>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

impl LockGuard {
    /// Wrap any droppable lock token from a backend implementation.
    pub fn new(inner: impl Any + Send) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

/// Grants scoped critical sections.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire the lock for `key`, waiting until it is free or the
    /// implementation's timeout elapses.
    async fn lock(&self, key: &LockKey) -> Result<LockGuard, CoordinationError>;
}

/// A wakeup: "stream `stream_id` may have pending work at `position_id`".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Wakeup {
    pub stream_id: String,
    pub position_id: String,
}

/// Best-effort wakeup fanout between producers and workers.
///
/// Built on an unbounded flume channel: every subscriber receiver competes
/// for messages, so one wakeup reaches one worker. Sending never blocks;
/// a send after all receivers are gone is silently dropped (the rescan
/// covers it).
#[derive(Clone)]
pub struct WakeupHub {
    tx: flume::Sender<Wakeup>,
    rx: flume::Receiver<Wakeup>,
}

impl Default for WakeupHub {
    fn default() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }
}

impl WakeupHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce possible pending work. Best-effort: errors are swallowed
    /// after a debug log.
    pub fn notify(&self, stream_id: impl Into<String>, position_id: impl Into<String>) {
        let wakeup = Wakeup {
            stream_id: stream_id.into(),
            position_id: position_id.into(),
        };
        if let Err(flume::TrySendError::Disconnected(w)) = self.tx.try_send(wakeup) {
            tracing::debug!(
                stream_id = %w.stream_id,
                position_id = %w.position_id,
                "wakeup dropped: no live subscribers"
            );
        }
    }

    /// A receiver competing for wakeups. Each message is delivered to one
    /// subscriber.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<Wakeup> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_display_is_scoped() {
        let key = LockKey::position("s1", "a");
        assert_eq!(key.to_string(), "position:s1:a");
        let key = LockKey::join_batch("s1", "p", "b");
        assert_eq!(key.to_string(), "join:s1:p:b");
    }

    #[tokio::test]
    async fn hub_delivers_to_a_subscriber() {
        let hub = WakeupHub::new();
        let rx = hub.subscribe();
        hub.notify("s1", "a");
        let wakeup = rx.recv_async().await.unwrap();
        assert_eq!(wakeup.stream_id, "s1");
        assert_eq!(wakeup.position_id, "a");
    }

    #[test]
    fn notify_without_subscribers_does_not_panic() {
        let hub = WakeupHub::new();
        hub.notify("s1", "a");
    }
}
