//! Analytics storage: post-session rollups, session records, evaluations.
//!
//! The worker writes here and never mutates the original logs. Baselines
//! read prior rows back out, so the store is also the engine's memory of
//! how expensive "normal" looks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from analytics store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum AnalyticsStoreError {
    #[error("analytics backend error: {message}")]
    #[diagnostic(code(rvbbit::analytics::backend))]
    Backend { message: String },
}

/// Cascade-level rollup for one session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeAnalyticsRow {
    pub session_id: String,
    pub cascade_id: String,
    pub genus_hash: Option<String>,
    pub input_category: String,
    pub input_fingerprint: String,
    pub total_cost: f64,
    pub duration_ms: u64,
    pub total_tokens: u64,
    pub message_count: u64,
    pub cell_count: u64,
    pub error_count: u64,
    pub candidate_count: u64,
    pub winner_candidate_index: Option<u32>,
    pub cost_z_score: f64,
    pub duration_z_score: f64,
    pub tokens_z_score: f64,
    pub is_outlier: bool,
    pub baseline_tier: String,
    pub total_context_cost: f64,
    pub total_new_cost: f64,
    pub confidence_score: Option<f64>,
    pub confidence_reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Cell-level rollup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CellAnalyticsRow {
    pub session_id: String,
    pub cascade_id: String,
    pub cell_name: String,
    pub species_hash: Option<String>,
    pub cost: f64,
    pub duration_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub llm_calls: u64,
    pub cost_z_score: f64,
    pub duration_z_score: f64,
    pub is_outlier: bool,
    pub context_cost: f64,
    pub new_cost: f64,
    pub created_at: DateTime<Utc>,
}

/// Per-injected-message cost contribution for one cell.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBreakdownRow {
    pub session_id: String,
    pub cell_name: String,
    pub message_hash: String,
    pub source_cell: Option<String>,
    pub role: String,
    pub tokens: u64,
    pub cost: f64,
    pub pct_of_cell_cost: f64,
    pub relevance_score: Option<f64>,
    pub relevance_reasoning: Option<String>,
}

/// Lifecycle record of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub cascade_id: String,
    pub parent_session_id: Option<String>,
    pub caller_id: Option<String>,
    pub invocation_metadata_json: Value,
    pub genus_hash: Option<String>,
    /// `active`, `suspended`, `completed`, or `error`.
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A human evaluation row (binary, preference, or flag).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRow {
    pub id: String,
    pub session_id: String,
    pub cell_name: Option<String>,
    pub cascade_id: Option<String>,
    pub evaluation_type: String,
    pub is_good: Option<bool>,
    pub preferred_candidate_index: Option<u32>,
    pub system_winner_index: Option<u32>,
    pub agreement: Option<bool>,
    pub output_text: Option<String>,
    pub mutation_applied: Option<String>,
    pub flagged: bool,
    pub flag_reason: Option<String>,
    pub notes: String,
    pub evaluator: String,
    pub created_at: DateTime<Utc>,
}

/// Storage the analytics worker and evaluation logger write to.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn insert_cascade_row(&self, row: CascadeAnalyticsRow)
        -> Result<(), AnalyticsStoreError>;
    async fn insert_cell_rows(&self, rows: Vec<CellAnalyticsRow>)
        -> Result<(), AnalyticsStoreError>;
    async fn insert_context_breakdown(
        &self,
        rows: Vec<ContextBreakdownRow>,
    ) -> Result<(), AnalyticsStoreError>;

    /// Prior cascade rows for baseline computation, newest first.
    async fn cascade_rows(
        &self,
        cascade_id: &str,
        limit: usize,
    ) -> Result<Vec<CascadeAnalyticsRow>, AnalyticsStoreError>;

    /// Prior cell rows for a `(cell_name, species_hash)` baseline.
    async fn cell_rows(
        &self,
        cascade_id: &str,
        cell_name: &str,
        limit: usize,
    ) -> Result<Vec<CellAnalyticsRow>, AnalyticsStoreError>;

    async fn upsert_session_record(&self, record: SessionRecord)
        -> Result<(), AnalyticsStoreError>;
    async fn session_record(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, AnalyticsStoreError>;

    async fn insert_evaluations(
        &self,
        rows: Vec<EvaluationRow>,
    ) -> Result<(), AnalyticsStoreError>;
}

/// In-process analytics store.
#[derive(Default)]
pub struct InMemoryAnalyticsStore {
    cascade_rows: RwLock<Vec<CascadeAnalyticsRow>>,
    cell_rows: RwLock<Vec<CellAnalyticsRow>>,
    breakdown_rows: RwLock<Vec<ContextBreakdownRow>>,
    sessions: RwLock<Vec<SessionRecord>>,
    evaluations: RwLock<Vec<EvaluationRow>>,
}

impl InMemoryAnalyticsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cascade_snapshot(&self) -> Vec<CascadeAnalyticsRow> {
        self.cascade_rows.read().clone()
    }

    #[must_use]
    pub fn cell_snapshot(&self) -> Vec<CellAnalyticsRow> {
        self.cell_rows.read().clone()
    }

    #[must_use]
    pub fn breakdown_snapshot(&self) -> Vec<ContextBreakdownRow> {
        self.breakdown_rows.read().clone()
    }

    #[must_use]
    pub fn evaluations_snapshot(&self) -> Vec<EvaluationRow> {
        self.evaluations.read().clone()
    }

    #[must_use]
    pub fn sessions_snapshot(&self) -> Vec<SessionRecord> {
        self.sessions.read().clone()
    }
}

#[async_trait]
impl AnalyticsStore for InMemoryAnalyticsStore {
    async fn insert_cascade_row(
        &self,
        row: CascadeAnalyticsRow,
    ) -> Result<(), AnalyticsStoreError> {
        self.cascade_rows.write().push(row);
        Ok(())
    }

    async fn insert_cell_rows(
        &self,
        rows: Vec<CellAnalyticsRow>,
    ) -> Result<(), AnalyticsStoreError> {
        self.cell_rows.write().extend(rows);
        Ok(())
    }

    async fn insert_context_breakdown(
        &self,
        rows: Vec<ContextBreakdownRow>,
    ) -> Result<(), AnalyticsStoreError> {
        self.breakdown_rows.write().extend(rows);
        Ok(())
    }

    async fn cascade_rows(
        &self,
        cascade_id: &str,
        limit: usize,
    ) -> Result<Vec<CascadeAnalyticsRow>, AnalyticsStoreError> {
        let mut rows: Vec<CascadeAnalyticsRow> = self
            .cascade_rows
            .read()
            .iter()
            .filter(|row| row.cascade_id == cascade_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn cell_rows(
        &self,
        cascade_id: &str,
        cell_name: &str,
        limit: usize,
    ) -> Result<Vec<CellAnalyticsRow>, AnalyticsStoreError> {
        let mut rows: Vec<CellAnalyticsRow> = self
            .cell_rows
            .read()
            .iter()
            .filter(|row| row.cascade_id == cascade_id && row.cell_name == cell_name)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn upsert_session_record(
        &self,
        record: SessionRecord,
    ) -> Result<(), AnalyticsStoreError> {
        let mut sessions = self.sessions.write();
        sessions.retain(|r| r.session_id != record.session_id);
        sessions.push(record);
        Ok(())
    }

    async fn session_record(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, AnalyticsStoreError> {
        Ok(self
            .sessions
            .read()
            .iter()
            .find(|r| r.session_id == session_id)
            .cloned())
    }

    async fn insert_evaluations(
        &self,
        rows: Vec<EvaluationRow>,
    ) -> Result<(), AnalyticsStoreError> {
        self.evaluations.write().extend(rows);
        Ok(())
    }
}
