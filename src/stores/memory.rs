//! In-memory store backend for tests and embedded single-process use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{StoreError, TokenStore};
use crate::token::{ForkGroup, StreamRecord, Token, TokenFailure, Trace};
use crate::types::{TokenStatus, TraceStatus};

#[derive(Default)]
struct Inner {
    tokens: FxHashMap<String, Token>,
    next_seq: u64,
    fork_groups: FxHashMap<(String, String), ForkGroup>,
    arrivals: FxHashMap<(String, String), Vec<Token>>,
    streams: FxHashMap<String, StreamRecord>,
    traces: FxHashMap<String, Trace>,
    usage: Vec<(String, String)>,
}

/// Token store backed by process memory behind one async mutex.
///
/// Atomicity of `claim` and `complete_join_batch` falls out of the single
/// lock. Data does not survive the process; production deployments use a
/// durable backend.
#[derive(Default)]
pub struct InMemoryTokenStore {
    inner: Mutex<Inner>,
}

impl InMemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn save(&self, token: &Token) -> Result<Token, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut stored = token.clone();
        match inner.tokens.get(&token.context_id) {
            Some(existing) => stored.seq = existing.seq,
            None => {
                inner.next_seq += 1;
                stored.seq = inner.next_seq;
            }
        }
        inner
            .tokens
            .insert(stored.context_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn save_all(&self, tokens: &[Token]) -> Result<Vec<Token>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut stored_all = Vec::with_capacity(tokens.len());
        for token in tokens {
            let mut stored = token.clone();
            match inner.tokens.get(&token.context_id) {
                Some(existing) => stored.seq = existing.seq,
                None => {
                    inner.next_seq += 1;
                    stored.seq = inner.next_seq;
                }
            }
            inner
                .tokens
                .insert(stored.context_id.clone(), stored.clone());
            stored_all.push(stored);
        }
        Ok(stored_all)
    }

    async fn save_all_and_archive(
        &self,
        tokens: &[Token],
        consumed_context_id: &str,
    ) -> Result<Vec<Token>, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.tokens.contains_key(consumed_context_id) {
            return Err(StoreError::TokenNotFound {
                context_id: consumed_context_id.to_string(),
            });
        }
        let mut stored_all = Vec::with_capacity(tokens.len());
        for token in tokens {
            let mut stored = token.clone();
            match inner.tokens.get(&token.context_id) {
                Some(existing) => stored.seq = existing.seq,
                None => {
                    inner.next_seq += 1;
                    stored.seq = inner.next_seq;
                }
            }
            inner
                .tokens
                .insert(stored.context_id.clone(), stored.clone());
            stored_all.push(stored);
        }
        let consumed = inner.tokens.get_mut(consumed_context_id).ok_or_else(|| {
            StoreError::TokenNotFound {
                context_id: consumed_context_id.to_string(),
            }
        })?;
        let now = Utc::now();
        consumed.status = TokenStatus::Archived;
        consumed.updated_at = now;
        consumed.archived_at = Some(now);
        Ok(stored_all)
    }

    async fn find(&self, context_id: &str) -> Result<Option<Token>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.tokens.get(context_id).cloned())
    }

    async fn find_by_position(
        &self,
        stream_id: &str,
        position_id: &str,
        status: Option<TokenStatus>,
    ) -> Result<Vec<Token>, StoreError> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<Token> = inner
            .tokens
            .values()
            .filter(|t| {
                t.stream_id == stream_id
                    && t.position_id == position_id
                    && status.map_or(true, |s| t.status == s)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.seq);
        Ok(matched)
    }

    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<Token>, StoreError> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<Token> = inner
            .tokens
            .values()
            .filter(|t| t.trace_id == trace_id)
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.seq);
        Ok(matched)
    }

    async fn pending_positions(&self) -> Result<Vec<(String, String)>, StoreError> {
        let inner = self.inner.lock().await;
        let mut positions: Vec<(String, String)> = inner
            .tokens
            .values()
            .filter(|t| t.status == TokenStatus::Pending)
            .map(|t| (t.stream_id.clone(), t.position_id.clone()))
            .collect();
        positions.sort();
        positions.dedup();
        Ok(positions)
    }

    async fn claim(&self, context_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.tokens.get_mut(context_id) {
            Some(token) if token.status == TokenStatus::Pending => {
                token.status = TokenStatus::Processing;
                token.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut released = 0u64;
        for token in inner.tokens.values_mut() {
            if token.status == TokenStatus::Processing && token.updated_at < older_than {
                token.status = TokenStatus::Pending;
                token.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn update_status(
        &self,
        context_id: &str,
        status: TokenStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let token = inner.tokens.get_mut(context_id).ok_or_else(|| {
            StoreError::TokenNotFound {
                context_id: context_id.to_string(),
            }
        })?;
        token.status = status;
        token.updated_at = Utc::now();
        Ok(())
    }

    async fn update_data(&self, context_id: &str, data: &Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let token = inner.tokens.get_mut(context_id).ok_or_else(|| {
            StoreError::TokenNotFound {
                context_id: context_id.to_string(),
            }
        })?;
        token.data = data.clone();
        token.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_sent(&self, context_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let token = inner.tokens.get_mut(context_id).ok_or_else(|| {
            StoreError::TokenNotFound {
                context_id: context_id.to_string(),
            }
        })?;
        token.sent = true;
        Ok(())
    }

    async fn archive(&self, context_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let token = inner.tokens.get_mut(context_id).ok_or_else(|| {
            StoreError::TokenNotFound {
                context_id: context_id.to_string(),
            }
        })?;
        token.status = TokenStatus::Archived;
        let now = Utc::now();
        token.updated_at = now;
        token.archived_at = Some(now);
        Ok(())
    }

    async fn record_error(
        &self,
        context_id: &str,
        failure: &TokenFailure,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let token = inner.tokens.get_mut(context_id).ok_or_else(|| {
            StoreError::TokenNotFound {
                context_id: context_id.to_string(),
            }
        })?;
        token.status = TokenStatus::Error;
        token.error = Some(failure.clone());
        token.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_stream_tokens(&self, stream_id: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut cancelled = 0u64;
        for token in inner.tokens.values_mut() {
            if token.stream_id == stream_id && token.status.is_live() {
                token.status = TokenStatus::Error;
                token.error = Some(TokenFailure::new(
                    token.position_id.clone(),
                    "cancelled",
                    "stream cancelled",
                ));
                token.updated_at = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn create_fork_group(&self, group: &ForkGroup) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.fork_groups.insert(
            (group.parallel_id.clone(), group.batch_id.clone()),
            group.clone(),
        );
        Ok(())
    }

    async fn fork_group(
        &self,
        parallel_id: &str,
        batch_id: &str,
    ) -> Result<Option<ForkGroup>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .fork_groups
            .get(&(parallel_id.to_string(), batch_id.to_string()))
            .cloned())
    }

    async fn complete_join_batch(
        &self,
        parallel_id: &str,
        batch_id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let group = inner
            .fork_groups
            .get_mut(&(parallel_id.to_string(), batch_id.to_string()))
            .ok_or_else(|| StoreError::ForkGroupNotFound {
                parallel_id: parallel_id.to_string(),
                batch_id: batch_id.to_string(),
            })?;
        if group.emitted {
            Ok(false)
        } else {
            group.emitted = true;
            Ok(true)
        }
    }

    async fn buffer_join_arrival(&self, token: &Token) -> Result<u32, StoreError> {
        let (parallel_id, batch_id) = token
            .batch_key()
            .map(|(p, b)| (p.to_string(), b.to_string()))
            .ok_or_else(|| StoreError::Backend {
                message: format!(
                    "token '{}' has no batch correlation",
                    token.context_id
                ),
            })?;
        let mut inner = self.inner.lock().await;
        let bucket = inner.arrivals.entry((parallel_id, batch_id)).or_default();
        if !bucket.iter().any(|t| t.context_id == token.context_id) {
            bucket.push(token.clone());
        }
        Ok(bucket.len() as u32)
    }

    async fn join_arrivals(
        &self,
        parallel_id: &str,
        batch_id: &str,
    ) -> Result<Vec<Token>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .arrivals
            .get(&(parallel_id.to_string(), batch_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_stream(&self, stream: &StreamRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.streams.insert(stream.stream_id.clone(), stream.clone());
        Ok(())
    }

    async fn stream(&self, stream_id: &str) -> Result<Option<StreamRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(stream_id).cloned())
    }

    async fn insert_trace(&self, trace: &Trace) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.traces.insert(trace.trace_id.clone(), trace.clone());
        Ok(())
    }

    async fn trace(&self, trace_id: &str) -> Result<Option<Trace>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.traces.get(trace_id).cloned())
    }

    async fn update_trace_status(
        &self,
        trace_id: &str,
        status: TraceStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let trace = inner.traces.get_mut(trace_id).ok_or_else(|| {
            StoreError::TraceNotFound {
                trace_id: trace_id.to_string(),
            }
        })?;
        if trace.status == TraceStatus::Running {
            trace.status = status;
            if status.is_terminal() {
                trace.ended_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn record_usage(&self, fitable: &str, definition_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .usage
            .push((fitable.to_string(), definition_id.to_string()));
        Ok(())
    }

    async fn usages_for(&self, fitable: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let mut seen = Vec::new();
        for (f, d) in &inner.usage {
            if f == fitable && !seen.contains(d) {
                seen.push(d.clone());
            }
        }
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn claim_is_single_winner() {
        let store = InMemoryTokenStore::new();
        let mut token = Token::root("s", "t", "a", json!({}));
        token.status = TokenStatus::Pending;
        let token = store.save(&token).await.unwrap();

        assert!(store.claim(&token.context_id).await.unwrap());
        assert!(!store.claim(&token.context_id).await.unwrap());
    }

    #[tokio::test]
    async fn save_assigns_monotonic_seq_once() {
        let store = InMemoryTokenStore::new();
        let a = store.save(&Token::root("s", "t", "a", json!({}))).await.unwrap();
        let b = store.save(&Token::root("s", "t", "a", json!({}))).await.unwrap();
        assert!(b.seq > a.seq);

        let again = store.save(&a).await.unwrap();
        assert_eq!(again.seq, a.seq);
    }
}
