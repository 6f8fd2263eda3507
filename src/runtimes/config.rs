//! Engine configuration.

use std::time::Duration;

/// Tunables of a [`FlowEngine`](super::FlowEngine).
///
/// ```rust
/// use waterflow::runtimes::EngineConfig;
///
/// let config = EngineConfig {
///     workers: 4,
///     ..EngineConfig::default()
/// };
/// assert_eq!(config.workers, 4);
/// ```
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of worker tasks spawned by `start`.
    pub workers: usize,
    /// Interval of the pending-token rescan, the fallback for missed
    /// notifications.
    pub rescan_interval: Duration,
    /// Timeout for acquiring a coordination lock.
    pub lock_timeout: Duration,
    /// Budget for one action execution; expiry fails the token, not the
    /// worker.
    pub action_timeout: Duration,
    /// Initial credit granted on each downstream link of the processor
    /// network.
    pub initial_credit: u64,
    /// Age after which a `Processing` claim counts as abandoned and is
    /// released back to `Pending` by the rescan. Must comfortably exceed
    /// `action_timeout`, or long-running actions get re-driven while still
    /// executing.
    pub claim_lease: Duration,
    /// SQLite database URL override. When unset, resolution falls back to
    /// the `WATERFLOW_DB` environment variable (a `.env` file is honored)
    /// and finally `waterflow.db`.
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            rescan_interval: Duration::from_millis(250),
            lock_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(60),
            initial_credit: 64,
            claim_lease: Duration::from_secs(300),
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Resolve the SQLite database URL: explicit override, then the
    /// `WATERFLOW_DB` environment variable, then `waterflow.db`.
    #[must_use]
    pub fn resolve_database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }
        dotenvy::dotenv().ok();
        match std::env::var("WATERFLOW_DB") {
            Ok(file) if !file.trim().is_empty() => format!("sqlite://{}", file.trim()),
            _ => "sqlite://waterflow.db".to_string(),
        }
    }
}
