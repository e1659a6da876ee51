//! Log store trait and the in-memory implementation.
//!
//! The log is append-only with two narrow exceptions driven by background
//! workers: late cost patches (correlated by `trace_id`, never by write
//! order) and winner marking on candidate rows. Everything else is insert
//! and read.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use thiserror::Error;

use super::row::LogRow;
use crate::types::NodeType;

/// Errors from log store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum LogStoreError {
    #[error("log backend error: {message}")]
    #[diagnostic(code(rvbbit::log::backend))]
    Backend { message: String },

    #[error("no log row with trace_id {trace_id}")]
    #[diagnostic(code(rvbbit::log::not_found))]
    NotFound { trace_id: String },
}

/// Cost fields merged onto an existing row by the cost tracker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CostPatch {
    pub cost: Option<f64>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub model_actual: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Persistent, concurrency-safe log storage.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append one row.
    async fn append(&self, row: LogRow) -> Result<(), LogStoreError>;

    /// Merge cost data onto the row with the given trace id.
    async fn patch_cost(&self, trace_id: &str, patch: CostPatch) -> Result<(), LogStoreError>;

    /// Attach an embedding to the row with the given trace id.
    async fn patch_embedding(
        &self,
        trace_id: &str,
        embedding: Vec<f32>,
    ) -> Result<(), LogStoreError>;

    /// Mark the winning candidate for a cell: the row whose
    /// `candidate_index` matches gets `is_winner = true`, its siblings get
    /// `false`.
    async fn mark_winner(
        &self,
        session_id: &str,
        cell_name: &str,
        candidate_index: u32,
    ) -> Result<(), LogStoreError>;

    /// All rows for a session ordered by timestamp.
    async fn rows_for_session(&self, session_id: &str) -> Result<Vec<LogRow>, LogStoreError>;

    /// Rows still missing an embedding, oldest first; the embedding worker's
    /// work queue.
    async fn rows_missing_embedding(&self, limit: usize) -> Result<Vec<LogRow>, LogStoreError>;
}

/// Volatile in-process log store for tests and embedded runs.
#[derive(Default)]
pub struct InMemoryLogStore {
    rows: RwLock<Vec<LogRow>>,
}

impl InMemoryLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous snapshot, handy in assertions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogRow> {
        self.rows.read().clone()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, row: LogRow) -> Result<(), LogStoreError> {
        self.rows.write().push(row);
        Ok(())
    }

    async fn patch_cost(&self, trace_id: &str, patch: CostPatch) -> Result<(), LogStoreError> {
        let mut rows = self.rows.write();
        let row = rows
            .iter_mut()
            .find(|row| row.trace_id == trace_id)
            .ok_or_else(|| LogStoreError::NotFound {
                trace_id: trace_id.to_string(),
            })?;
        row.cost = patch.cost;
        if patch.tokens_in.is_some() {
            row.tokens_in = patch.tokens_in;
        }
        if patch.tokens_out.is_some() {
            row.tokens_out = patch.tokens_out;
        }
        if patch.model_actual.is_some() {
            row.model_actual = patch.model_actual;
        }
        if patch.duration_ms.is_some() {
            row.duration_ms = patch.duration_ms;
        }
        Ok(())
    }

    async fn patch_embedding(
        &self,
        trace_id: &str,
        embedding: Vec<f32>,
    ) -> Result<(), LogStoreError> {
        let mut rows = self.rows.write();
        let row = rows
            .iter_mut()
            .find(|row| row.trace_id == trace_id)
            .ok_or_else(|| LogStoreError::NotFound {
                trace_id: trace_id.to_string(),
            })?;
        row.content_embedding = Some(embedding);
        Ok(())
    }

    async fn mark_winner(
        &self,
        session_id: &str,
        cell_name: &str,
        candidate_index: u32,
    ) -> Result<(), LogStoreError> {
        let mut rows = self.rows.write();
        for row in rows.iter_mut() {
            if row.session_id == session_id
                && row.cell_name.as_deref() == Some(cell_name)
                && row.candidate_index.is_some()
            {
                row.is_winner = Some(row.candidate_index == Some(candidate_index));
            }
        }
        Ok(())
    }

    async fn rows_for_session(&self, session_id: &str) -> Result<Vec<LogRow>, LogStoreError> {
        let mut rows: Vec<LogRow> = self
            .rows
            .read()
            .iter()
            .filter(|row| row.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.timestamp);
        Ok(rows)
    }

    async fn rows_missing_embedding(&self, limit: usize) -> Result<Vec<LogRow>, LogStoreError> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|row| {
                row.content_embedding.is_none()
                    && matches!(row.node_type, NodeType::Agent | NodeType::ToolResult)
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn patch_cost_correlates_by_trace_id() {
        let store = InMemoryLogStore::new();
        let row = LogRow::new("s", NodeType::Agent, "assistant", json!({"x": 1}));
        let trace_id = row.trace_id.clone();
        store.append(row).await.unwrap();

        store
            .patch_cost(
                &trace_id,
                CostPatch {
                    cost: Some(0.002),
                    tokens_in: Some(120),
                    tokens_out: Some(30),
                    ..CostPatch::default()
                },
            )
            .await
            .unwrap();

        let rows = store.rows_for_session("s").await.unwrap();
        assert_eq!(rows[0].cost, Some(0.002));
        assert_eq!(rows[0].tokens_in, Some(120));
    }

    #[tokio::test]
    async fn mark_winner_touches_only_candidate_rows() {
        let store = InMemoryLogStore::new();
        for index in 0..3u32 {
            let row = LogRow::new("s", NodeType::SoundingAttempt, "assistant", json!(index))
                .in_cell("gen", "demo")
                .with_candidate(index);
            store.append(row).await.unwrap();
        }
        let plain = LogRow::new("s", NodeType::Agent, "assistant", json!("evaluator"))
            .in_cell("gen", "demo");
        store.append(plain).await.unwrap();

        store.mark_winner("s", "gen", 1).await.unwrap();
        let rows = store.rows_for_session("s").await.unwrap();
        let winners: Vec<_> = rows.iter().filter(|r| r.is_winner == Some(true)).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].candidate_index, Some(1));
        assert!(rows.iter().any(|r| r.candidate_index.is_none() && r.is_winner.is_none()));
    }
}
