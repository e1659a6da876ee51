//! SQLite-backed log store.
//!
//! Durable stand-in for the production columnar store: one wide table,
//! month-partition-friendly ordering on `(timestamp, session_id)`, JSON
//! columns stored as TEXT. Patches touch single rows by `trace_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::sync::Arc;

use super::row::LogRow;
use super::store::{CostPatch, LogStore, LogStoreError};
use crate::types::NodeType;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS unified_logs (
    session_id TEXT NOT NULL,
    trace_id TEXT PRIMARY KEY,
    parent_trace_id TEXT,
    timestamp TEXT NOT NULL,
    role TEXT NOT NULL,
    node_type TEXT NOT NULL,
    cell_name TEXT,
    cascade_id TEXT,
    model_requested TEXT,
    model_actual TEXT,
    cost REAL,
    tokens_in INTEGER,
    tokens_out INTEGER,
    duration_ms INTEGER,
    content_json TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    content_embedding TEXT,
    context_hashes TEXT NOT NULL,
    candidate_index INTEGER,
    is_winner INTEGER,
    mutation_applied TEXT,
    mutation_type TEXT,
    species_hash TEXT,
    genus_hash TEXT,
    full_request_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_unified_logs_session
    ON unified_logs (session_id, timestamp);
"#;

/// Log store persisted to SQLite through `sqlx`.
pub struct SqliteLogStore {
    pool: Arc<SqlitePool>,
}

impl SqliteLogStore {
    /// Connect (or create) the database at `database_url` and ensure the
    /// schema exists. Example URL: `sqlite://rvbbit.db?mode=rwc`.
    pub async fn connect(database_url: &str) -> Result<Self, LogStoreError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(backend)?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(backend)?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Wrap an existing pool (shared with other stores).
    pub async fn from_pool(pool: Arc<SqlitePool>) -> Result<Self, LogStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(pool.as_ref())
            .await
            .map_err(backend)?;
        Ok(Self { pool })
    }
}

fn backend(err: sqlx::Error) -> LogStoreError {
    LogStoreError::Backend {
        message: err.to_string(),
    }
}

fn decode(err: serde_json::Error) -> LogStoreError {
    LogStoreError::Backend {
        message: format!("row decode: {err}"),
    }
}

fn row_from_sqlite(row: &SqliteRow) -> Result<LogRow, LogStoreError> {
    let timestamp: String = row.get("timestamp");
    let timestamp = timestamp
        .parse::<DateTime<Utc>>()
        .map_err(|e| LogStoreError::Backend {
            message: format!("bad timestamp: {e}"),
        })?;
    let node_type: String = row.get("node_type");
    let node_type: NodeType = serde_json::from_value(serde_json::Value::String(node_type))
        .map_err(decode)?;
    let content_json: String = row.get("content_json");
    let context_hashes: String = row.get("context_hashes");
    let content_embedding: Option<String> = row.get("content_embedding");
    let full_request_json: Option<String> = row.get("full_request_json");
    let is_winner: Option<i64> = row.get("is_winner");

    Ok(LogRow {
        session_id: row.get("session_id"),
        trace_id: row.get("trace_id"),
        parent_trace_id: row.get("parent_trace_id"),
        timestamp,
        role: row.get("role"),
        node_type,
        cell_name: row.get("cell_name"),
        cascade_id: row.get("cascade_id"),
        model_requested: row.get("model_requested"),
        model_actual: row.get("model_actual"),
        cost: row.get("cost"),
        tokens_in: row.get::<Option<i64>, _>("tokens_in").map(|v| v as u64),
        tokens_out: row.get::<Option<i64>, _>("tokens_out").map(|v| v as u64),
        duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|v| v as u64),
        content_json: serde_json::from_str(&content_json).map_err(decode)?,
        content_hash: row.get("content_hash"),
        content_embedding: content_embedding
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(decode)?,
        context_hashes: serde_json::from_str(&context_hashes).map_err(decode)?,
        candidate_index: row
            .get::<Option<i64>, _>("candidate_index")
            .map(|v| v as u32),
        is_winner: is_winner.map(|v| v != 0),
        mutation_applied: row.get("mutation_applied"),
        mutation_type: row.get("mutation_type"),
        species_hash: row.get("species_hash"),
        genus_hash: row.get("genus_hash"),
        full_request_json: full_request_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(decode)?,
    })
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn append(&self, row: LogRow) -> Result<(), LogStoreError> {
        let content_json =
            serde_json::to_string(&row.content_json).map_err(decode)?;
        let context_hashes =
            serde_json::to_string(&row.context_hashes).map_err(decode)?;
        let content_embedding = row
            .content_embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(decode)?;
        let full_request_json = row
            .full_request_json
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(decode)?;

        sqlx::query(
            r#"INSERT INTO unified_logs (
                session_id, trace_id, parent_trace_id, timestamp, role, node_type,
                cell_name, cascade_id, model_requested, model_actual,
                cost, tokens_in, tokens_out, duration_ms,
                content_json, content_hash, content_embedding, context_hashes,
                candidate_index, is_winner, mutation_applied, mutation_type,
                species_hash, genus_hash, full_request_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&row.session_id)
        .bind(&row.trace_id)
        .bind(&row.parent_trace_id)
        .bind(row.timestamp.to_rfc3339())
        .bind(&row.role)
        .bind(row.node_type.as_str())
        .bind(&row.cell_name)
        .bind(&row.cascade_id)
        .bind(&row.model_requested)
        .bind(&row.model_actual)
        .bind(row.cost)
        .bind(row.tokens_in.map(|v| v as i64))
        .bind(row.tokens_out.map(|v| v as i64))
        .bind(row.duration_ms.map(|v| v as i64))
        .bind(content_json)
        .bind(&row.content_hash)
        .bind(content_embedding)
        .bind(context_hashes)
        .bind(row.candidate_index.map(|v| v as i64))
        .bind(row.is_winner.map(i64::from))
        .bind(&row.mutation_applied)
        .bind(&row.mutation_type)
        .bind(&row.species_hash)
        .bind(&row.genus_hash)
        .bind(full_request_json)
        .execute(self.pool.as_ref())
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn patch_cost(&self, trace_id: &str, patch: CostPatch) -> Result<(), LogStoreError> {
        let result = sqlx::query(
            r#"UPDATE unified_logs SET
                cost = ?,
                tokens_in = COALESCE(?, tokens_in),
                tokens_out = COALESCE(?, tokens_out),
                model_actual = COALESCE(?, model_actual),
                duration_ms = COALESCE(?, duration_ms)
            WHERE trace_id = ?"#,
        )
        .bind(patch.cost)
        .bind(patch.tokens_in.map(|v| v as i64))
        .bind(patch.tokens_out.map(|v| v as i64))
        .bind(&patch.model_actual)
        .bind(patch.duration_ms.map(|v| v as i64))
        .bind(trace_id)
        .execute(self.pool.as_ref())
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(LogStoreError::NotFound {
                trace_id: trace_id.to_string(),
            });
        }
        Ok(())
    }

    async fn patch_embedding(
        &self,
        trace_id: &str,
        embedding: Vec<f32>,
    ) -> Result<(), LogStoreError> {
        let encoded = serde_json::to_string(&embedding).map_err(decode)?;
        let result = sqlx::query("UPDATE unified_logs SET content_embedding = ? WHERE trace_id = ?")
            .bind(encoded)
            .bind(trace_id)
            .execute(self.pool.as_ref())
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(LogStoreError::NotFound {
                trace_id: trace_id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_winner(
        &self,
        session_id: &str,
        cell_name: &str,
        candidate_index: u32,
    ) -> Result<(), LogStoreError> {
        sqlx::query(
            r#"UPDATE unified_logs SET is_winner = (candidate_index = ?)
            WHERE session_id = ? AND cell_name = ? AND candidate_index IS NOT NULL"#,
        )
        .bind(candidate_index as i64)
        .bind(session_id)
        .bind(cell_name)
        .execute(self.pool.as_ref())
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn rows_for_session(&self, session_id: &str) -> Result<Vec<LogRow>, LogStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM unified_logs WHERE session_id = ? ORDER BY timestamp, trace_id",
        )
        .bind(session_id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(backend)?;
        rows.iter().map(row_from_sqlite).collect()
    }

    async fn rows_missing_embedding(&self, limit: usize) -> Result<Vec<LogRow>, LogStoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM unified_logs
            WHERE content_embedding IS NULL AND node_type IN ('agent', 'tool_result')
            ORDER BY timestamp LIMIT ?"#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(backend)?;
        rows.iter().map(row_from_sqlite).collect()
    }
}
