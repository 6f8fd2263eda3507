//! Worker event loop.

use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::engine::EngineInner;
use super::EngineError;

/// One worker: race wakeups against the periodic rescan until shutdown.
///
/// Wakeups are best-effort hints; the rescan re-derives the real worklist
/// from the store, so a lost, duplicated, or reordered wakeup costs at
/// most one rescan interval of latency.
pub(crate) async fn run_worker(
    worker_id: usize,
    inner: Arc<EngineInner>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let wakeups = inner.hub.subscribe();
    let mut rescan = tokio::time::interval(inner.config.rescan_interval);
    rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    debug!(worker_id, "worker started");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!(worker_id, "worker shutting down");
                break;
            }
            wakeup = wakeups.recv_async() => {
                match wakeup {
                    Ok(wakeup) => {
                        match inner.handle_position(&wakeup.stream_id, &wakeup.position_id).await {
                            Ok(()) | Err(EngineError::CorruptState { .. }) => {}
                            Err(err) => warn!(
                                worker_id,
                                stream_id = %wakeup.stream_id,
                                position_id = %wakeup.position_id,
                                error = %err,
                                "wakeup handling failed; rescan will retry"
                            ),
                        }
                    }
                    Err(_) => {
                        debug!(worker_id, "wakeup hub closed; worker exiting");
                        break;
                    }
                }
            }
            _ = rescan.tick() => {
                if let Err(err) = inner.rescan().await {
                    warn!(worker_id, error = %err, "rescan failed");
                }
            }
        }
    }
}
