//! SQLite store backend (sqlx).
//!
//! Schema is created idempotently on connect; queries are bound at run
//! time, so builds never need a live database. One pool serves all workers
//! of the process; `claim` and `complete_join_batch` rely on SQLite's
//! single-writer guarantee for their conditional updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

use super::{StoreError, TokenStore};
use crate::token::{ForkGroup, StreamRecord, Token, TokenFailure, Trace};
use crate::types::{ParallelMode, TokenStatus, TraceStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tokens (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    context_id   TEXT NOT NULL UNIQUE,
    stream_id    TEXT NOT NULL,
    trace_id     TEXT NOT NULL,
    trans_id     TEXT NOT NULL,
    root_id      TEXT NOT NULL,
    position_id  TEXT NOT NULL,
    data         TEXT NOT NULL,
    status       TEXT NOT NULL,
    parallel_id  TEXT,
    parallel_mode TEXT,
    batch_id     TEXT,
    to_batch     INTEGER NOT NULL DEFAULT 0,
    joined       INTEGER NOT NULL DEFAULT 0,
    sent         INTEGER NOT NULL DEFAULT 0,
    error        TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    archived_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_tokens_position ON tokens (stream_id, position_id, status);
CREATE INDEX IF NOT EXISTS idx_tokens_trace ON tokens (trace_id);
CREATE TABLE IF NOT EXISTS traces (
    trace_id    TEXT PRIMARY KEY,
    operator    TEXT NOT NULL,
    application TEXT NOT NULL,
    start_node  TEXT NOT NULL,
    status      TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    ended_at    TEXT
);
CREATE TABLE IF NOT EXISTS streams (
    stream_id     TEXT PRIMARY KEY,
    definition_id TEXT NOT NULL,
    trace_id      TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS fork_groups (
    parallel_id  TEXT NOT NULL,
    batch_id     TEXT NOT NULL,
    stream_id    TEXT NOT NULL,
    branch_count INTEGER NOT NULL,
    emitted      INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (parallel_id, batch_id)
);
CREATE TABLE IF NOT EXISTS join_arrivals (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    parallel_id TEXT NOT NULL,
    batch_id    TEXT NOT NULL,
    context_id  TEXT NOT NULL,
    token       TEXT NOT NULL,
    arrived_at  TEXT NOT NULL,
    UNIQUE (parallel_id, batch_id, context_id)
);
CREATE TABLE IF NOT EXISTS action_usage (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    fitable       TEXT NOT NULL,
    definition_id TEXT NOT NULL,
    recorded_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_action_usage_fitable ON action_usage (fitable);
"#;

/// Durable token store on a SQLite database.
pub struct SqliteTokenStore {
    pool: SqlitePool,
}

impl SqliteTokenStore {
    /// Connect to `database_url` (e.g. `sqlite://waterflow.db`), creating
    /// the file and schema when missing.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool; the schema is still ensured.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_token<'e, E>(executor: E, token: &Token) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let error_json = token
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO tokens (
                context_id, stream_id, trace_id, trans_id, root_id, position_id,
                data, status, parallel_id, parallel_mode, batch_id,
                to_batch, joined, sent, error, created_at, updated_at, archived_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(context_id) DO UPDATE SET
                position_id = excluded.position_id,
                data = excluded.data,
                status = excluded.status,
                parallel_id = excluded.parallel_id,
                parallel_mode = excluded.parallel_mode,
                batch_id = excluded.batch_id,
                to_batch = excluded.to_batch,
                joined = excluded.joined,
                sent = excluded.sent,
                error = excluded.error,
                updated_at = excluded.updated_at,
                archived_at = excluded.archived_at
            "#,
        )
        .bind(&token.context_id)
        .bind(&token.stream_id)
        .bind(&token.trace_id)
        .bind(&token.trans_id)
        .bind(&token.root_id)
        .bind(&token.position_id)
        .bind(token.data.to_string())
        .bind(token.status.encode())
        .bind(&token.parallel_id)
        .bind(token.parallel_mode.map(|m| m.encode()))
        .bind(&token.batch_id)
        .bind(token.to_batch)
        .bind(token.joined)
        .bind(token.sent)
        .bind(error_json)
        .bind(token.created_at.to_rfc3339())
        .bind(token.updated_at.to_rfc3339())
        .bind(token.archived_at.map(|t| t.to_rfc3339()))
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn fetch_token(&self, context_id: &str) -> Result<Option<Token>, StoreError> {
        let row = sqlx::query("SELECT * FROM tokens WHERE context_id = ?")
            .bind(context_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_token(&r)).transpose()
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend {
            message: format!("bad timestamp '{raw}': {e}"),
        })
}

fn row_to_token(row: &SqliteRow) -> Result<Token, StoreError> {
    let data_raw: String = row.try_get("data")?;
    let error_raw: Option<String> = row.try_get("error")?;
    let error: Option<TokenFailure> = error_raw
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    let status_raw: String = row.try_get("status")?;
    let mode_raw: Option<String> = row.try_get("parallel_mode")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;
    let archived_raw: Option<String> = row.try_get("archived_at")?;
    let seq: i64 = row.try_get("seq")?;

    Ok(Token {
        context_id: row.try_get("context_id")?,
        stream_id: row.try_get("stream_id")?,
        trace_id: row.try_get("trace_id")?,
        trans_id: row.try_get("trans_id")?,
        root_id: row.try_get("root_id")?,
        position_id: row.try_get("position_id")?,
        data: serde_json::from_str(&data_raw)?,
        status: TokenStatus::decode(&status_raw),
        parallel_id: row.try_get("parallel_id")?,
        parallel_mode: mode_raw.as_deref().map(ParallelMode::decode),
        batch_id: row.try_get("batch_id")?,
        to_batch: row.try_get("to_batch")?,
        joined: row.try_get("joined")?,
        sent: row.try_get("sent")?,
        seq: seq as u64,
        error,
        created_at: parse_timestamp(&created_raw)?,
        updated_at: parse_timestamp(&updated_raw)?,
        archived_at: archived_raw.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn row_to_trace(row: &SqliteRow) -> Result<Trace, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let started_raw: String = row.try_get("started_at")?;
    let ended_raw: Option<String> = row.try_get("ended_at")?;
    Ok(Trace {
        trace_id: row.try_get("trace_id")?,
        operator: row.try_get("operator")?,
        application: row.try_get("application")?,
        start_node: row.try_get("start_node")?,
        status: TraceStatus::decode(&status_raw),
        started_at: parse_timestamp(&started_raw)?,
        ended_at: ended_raw.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    #[instrument(skip(self, token), fields(context_id = %token.context_id))]
    async fn save(&self, token: &Token) -> Result<Token, StoreError> {
        Self::upsert_token(&self.pool, token).await?;
        self.fetch_token(&token.context_id)
            .await?
            .ok_or_else(|| StoreError::TokenNotFound {
                context_id: token.context_id.clone(),
            })
    }

    #[instrument(skip(self, tokens), fields(count = tokens.len()))]
    async fn save_all(&self, tokens: &[Token]) -> Result<Vec<Token>, StoreError> {
        let mut tx = self.pool.begin().await?;
        for token in tokens {
            Self::upsert_token(&mut *tx, token).await?;
        }
        tx.commit().await?;

        let mut stored = Vec::with_capacity(tokens.len());
        for token in tokens {
            stored.push(self.fetch_token(&token.context_id).await?.ok_or_else(|| {
                StoreError::TokenNotFound {
                    context_id: token.context_id.clone(),
                }
            })?);
        }
        Ok(stored)
    }

    #[instrument(skip(self, tokens), fields(count = tokens.len(), consumed = %consumed_context_id))]
    async fn save_all_and_archive(
        &self,
        tokens: &[Token],
        consumed_context_id: &str,
    ) -> Result<Vec<Token>, StoreError> {
        let mut tx = self.pool.begin().await?;
        for token in tokens {
            Self::upsert_token(&mut *tx, token).await?;
        }
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tokens SET status = ?, updated_at = ?, archived_at = ? WHERE context_id = ?",
        )
        .bind(TokenStatus::Archived.encode())
        .bind(&now)
        .bind(&now)
        .bind(consumed_context_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            // Dropping the transaction rolls the successor upserts back.
            return Err(StoreError::TokenNotFound {
                context_id: consumed_context_id.to_string(),
            });
        }
        tx.commit().await?;

        let mut stored = Vec::with_capacity(tokens.len());
        for token in tokens {
            stored.push(self.fetch_token(&token.context_id).await?.ok_or_else(|| {
                StoreError::TokenNotFound {
                    context_id: token.context_id.clone(),
                }
            })?);
        }
        Ok(stored)
    }

    async fn find(&self, context_id: &str) -> Result<Option<Token>, StoreError> {
        self.fetch_token(context_id).await
    }

    async fn find_by_position(
        &self,
        stream_id: &str,
        position_id: &str,
        status: Option<TokenStatus>,
    ) -> Result<Vec<Token>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM tokens WHERE stream_id = ? AND position_id = ? AND status = ? ORDER BY seq",
                )
                .bind(stream_id)
                .bind(position_id)
                .bind(status.encode())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM tokens WHERE stream_id = ? AND position_id = ? ORDER BY seq",
                )
                .bind(stream_id)
                .bind(position_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_token).collect()
    }

    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<Token>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tokens WHERE trace_id = ? ORDER BY seq")
            .bind(trace_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_token).collect()
    }

    async fn pending_positions(&self) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT stream_id, position_id FROM tokens WHERE status = ? ORDER BY stream_id, position_id",
        )
        .bind(TokenStatus::Pending.encode())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok((
                    r.try_get::<String, _>("stream_id")?,
                    r.try_get::<String, _>("position_id")?,
                ))
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn claim(&self, context_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tokens SET status = ?, updated_at = ? WHERE context_id = ? AND status = ?",
        )
        .bind(TokenStatus::Processing.encode())
        .bind(Utc::now().to_rfc3339())
        .bind(context_id)
        .bind(TokenStatus::Pending.encode())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn reset_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE tokens SET status = ?, updated_at = ? WHERE status = ? AND updated_at < ?",
        )
        .bind(TokenStatus::Pending.encode())
        .bind(Utc::now().to_rfc3339())
        .bind(TokenStatus::Processing.encode())
        .bind(older_than.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_status(
        &self,
        context_id: &str,
        status: TokenStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tokens SET status = ?, updated_at = ? WHERE context_id = ?")
            .bind(status.encode())
            .bind(Utc::now().to_rfc3339())
            .bind(context_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TokenNotFound {
                context_id: context_id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_data(&self, context_id: &str, data: &Value) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tokens SET data = ?, updated_at = ? WHERE context_id = ?")
            .bind(data.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(context_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TokenNotFound {
                context_id: context_id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_sent(&self, context_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tokens SET sent = 1 WHERE context_id = ?")
            .bind(context_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TokenNotFound {
                context_id: context_id.to_string(),
            });
        }
        Ok(())
    }

    async fn archive(&self, context_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tokens SET status = ?, updated_at = ?, archived_at = ? WHERE context_id = ?",
        )
        .bind(TokenStatus::Archived.encode())
        .bind(&now)
        .bind(&now)
        .bind(context_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TokenNotFound {
                context_id: context_id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_error(
        &self,
        context_id: &str,
        failure: &TokenFailure,
    ) -> Result<(), StoreError> {
        let failure_json = serde_json::to_string(failure)?;
        let result = sqlx::query(
            "UPDATE tokens SET status = ?, error = ?, updated_at = ? WHERE context_id = ?",
        )
        .bind(TokenStatus::Error.encode())
        .bind(failure_json)
        .bind(Utc::now().to_rfc3339())
        .bind(context_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TokenNotFound {
                context_id: context_id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_stream_tokens(&self, stream_id: &str) -> Result<u64, StoreError> {
        let failure = serde_json::to_string(&TokenFailure::new(
            String::new(),
            "cancelled",
            "stream cancelled",
        ))?;
        let result = sqlx::query(
            "UPDATE tokens SET status = ?, error = ?, updated_at = ?
             WHERE stream_id = ? AND status IN (?, ?, ?)",
        )
        .bind(TokenStatus::Error.encode())
        .bind(failure)
        .bind(Utc::now().to_rfc3339())
        .bind(stream_id)
        .bind(TokenStatus::Created.encode())
        .bind(TokenStatus::Pending.encode())
        .bind(TokenStatus::Processing.encode())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn create_fork_group(&self, group: &ForkGroup) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO fork_groups
             (parallel_id, batch_id, stream_id, branch_count, emitted, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&group.parallel_id)
        .bind(&group.batch_id)
        .bind(&group.stream_id)
        .bind(group.branch_count as i64)
        .bind(group.emitted)
        .bind(group.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fork_group(
        &self,
        parallel_id: &str,
        batch_id: &str,
    ) -> Result<Option<ForkGroup>, StoreError> {
        let row = sqlx::query("SELECT * FROM fork_groups WHERE parallel_id = ? AND batch_id = ?")
            .bind(parallel_id)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let branch_count: i64 = r.try_get("branch_count")?;
            let created_raw: String = r.try_get("created_at")?;
            Ok(ForkGroup {
                parallel_id: r.try_get("parallel_id")?,
                batch_id: r.try_get("batch_id")?,
                stream_id: r.try_get("stream_id")?,
                branch_count: branch_count as u32,
                emitted: r.try_get("emitted")?,
                created_at: parse_timestamp(&created_raw)?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn complete_join_batch(
        &self,
        parallel_id: &str,
        batch_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE fork_groups SET emitted = 1
             WHERE parallel_id = ? AND batch_id = ? AND emitted = 0",
        )
        .bind(parallel_id)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Lost the race, or the group never existed.
        let exists = sqlx::query("SELECT 1 FROM fork_groups WHERE parallel_id = ? AND batch_id = ?")
            .bind(parallel_id)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(StoreError::ForkGroupNotFound {
                parallel_id: parallel_id.to_string(),
                batch_id: batch_id.to_string(),
            })
        }
    }

    async fn buffer_join_arrival(&self, token: &Token) -> Result<u32, StoreError> {
        let (parallel_id, batch_id) =
            token.batch_key().ok_or_else(|| StoreError::Backend {
                message: format!("token '{}' has no batch correlation", token.context_id),
            })?;
        let token_json = serde_json::to_string(token)?;
        sqlx::query(
            "INSERT OR IGNORE INTO join_arrivals
             (parallel_id, batch_id, context_id, token, arrived_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(parallel_id)
        .bind(batch_id)
        .bind(&token.context_id)
        .bind(token_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS arrivals FROM join_arrivals WHERE parallel_id = ? AND batch_id = ?",
        )
        .bind(parallel_id)
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;
        let arrivals: i64 = row.try_get("arrivals")?;
        Ok(arrivals as u32)
    }

    async fn join_arrivals(
        &self,
        parallel_id: &str,
        batch_id: &str,
    ) -> Result<Vec<Token>, StoreError> {
        let rows = sqlx::query(
            "SELECT token FROM join_arrivals WHERE parallel_id = ? AND batch_id = ? ORDER BY id",
        )
        .bind(parallel_id)
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let raw: String = r.try_get("token")?;
                Ok(serde_json::from_str(&raw)?)
            })
            .collect()
    }

    async fn insert_stream(&self, stream: &StreamRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO streams (stream_id, definition_id, trace_id, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&stream.stream_id)
        .bind(&stream.definition_id)
        .bind(&stream.trace_id)
        .bind(stream.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stream(&self, stream_id: &str) -> Result<Option<StreamRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM streams WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let created_raw: String = r.try_get("created_at")?;
            Ok(StreamRecord {
                stream_id: r.try_get("stream_id")?,
                definition_id: r.try_get("definition_id")?,
                trace_id: r.try_get("trace_id")?,
                created_at: parse_timestamp(&created_raw)?,
            })
        })
        .transpose()
    }

    async fn insert_trace(&self, trace: &Trace) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO traces
             (trace_id, operator, application, start_node, status, started_at, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trace.trace_id)
        .bind(&trace.operator)
        .bind(&trace.application)
        .bind(&trace.start_node)
        .bind(trace.status.encode())
        .bind(trace.started_at.to_rfc3339())
        .bind(trace.ended_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn trace(&self, trace_id: &str) -> Result<Option<Trace>, StoreError> {
        let row = sqlx::query("SELECT * FROM traces WHERE trace_id = ?")
            .bind(trace_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_trace(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn update_trace_status(
        &self,
        trace_id: &str,
        status: TraceStatus,
    ) -> Result<(), StoreError> {
        let ended_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        let result = sqlx::query(
            "UPDATE traces SET status = ?, ended_at = ? WHERE trace_id = ? AND status = ?",
        )
        .bind(status.encode())
        .bind(ended_at)
        .bind(trace_id)
        .bind(TraceStatus::Running.encode())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM traces WHERE trace_id = ?")
                .bind(trace_id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            if !exists {
                return Err(StoreError::TraceNotFound {
                    trace_id: trace_id.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn record_usage(&self, fitable: &str, definition_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO action_usage (fitable, definition_id, recorded_at) VALUES (?, ?, ?)",
        )
        .bind(fitable)
        .bind(definition_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usages_for(&self, fitable: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT definition_id FROM action_usage WHERE fitable = ? GROUP BY definition_id ORDER BY MIN(id)",
        )
        .bind(fitable)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok(r.try_get::<String, _>("definition_id")?))
            .collect()
    }
}
