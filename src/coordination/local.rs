//! In-process lock service backed by keyed async mutexes.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

use super::{CoordinationError, LockGuard, LockKey, LockService};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock service for a single process: one `tokio::sync::Mutex` per key,
/// created on first use. Guards are owned, so they may cross await points
/// and task boundaries.
pub struct LocalLockService {
    locks: Mutex<FxHashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
    lock_timeout: Duration,
}

impl Default for LocalLockService {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LocalLockService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(lock_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(FxHashMap::default()),
            lock_timeout,
        }
    }

    fn mutex_for(&self, key: &LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

#[async_trait]
impl LockService for LocalLockService {
    async fn lock(&self, key: &LockKey) -> Result<LockGuard, CoordinationError> {
        let mutex = self.mutex_for(key);
        let guard = timeout(self.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| CoordinationError::LockTimeout {
                key: key.to_string(),
            })?;
        Ok(LockGuard::new(guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_excludes() {
        let service = LocalLockService::with_timeout(Duration::from_millis(50));
        let key = LockKey::position("s", "a");
        let _held = service.lock(&key).await.unwrap();
        let err = service.lock(&key).await.unwrap_err();
        assert!(matches!(err, CoordinationError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let service = LocalLockService::new();
        let _a = service.lock(&LockKey::position("s", "a")).await.unwrap();
        let _b = service.lock(&LockKey::position("s", "b")).await.unwrap();
    }

    #[tokio::test]
    async fn drop_releases() {
        let service = LocalLockService::with_timeout(Duration::from_millis(50));
        let key = LockKey::position("s", "a");
        {
            let _held = service.lock(&key).await.unwrap();
        }
        assert!(service.lock(&key).await.is_ok());
    }
}
