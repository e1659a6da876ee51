//! Human evaluation capture.
//!
//! Binary good/bad ratings for quick labeling, preference picks across
//! candidate attempts (recording whether the human agreed with the system's
//! winner), and review flags. Writes are buffered; evaluations are few and
//! important, so the buffer is small.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

use crate::analytics::{AnalyticsStore, AnalyticsStoreError, EvaluationRow};

const BUFFER_LIMIT: usize = 10;

/// Buffered logger for human evaluations.
pub struct EvaluationsLog {
    store: Arc<dyn AnalyticsStore>,
    buffer: Mutex<Vec<EvaluationRow>>,
}

impl EvaluationsLog {
    #[must_use]
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self {
            store,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Record a binary good/bad rating.
    pub async fn log_binary(
        &self,
        session_id: &str,
        cell_name: Option<&str>,
        cascade_id: Option<&str>,
        is_good: bool,
        output_text: Option<&str>,
        notes: &str,
    ) -> Result<String, AnalyticsStoreError> {
        let row = EvaluationRow {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            cell_name: cell_name.map(str::to_string),
            cascade_id: cascade_id.map(str::to_string),
            evaluation_type: "binary".to_string(),
            is_good: Some(is_good),
            preferred_candidate_index: None,
            system_winner_index: None,
            agreement: None,
            output_text: output_text.map(str::to_string),
            mutation_applied: None,
            flagged: false,
            flag_reason: None,
            notes: notes.to_string(),
            evaluator: "human".to_string(),
            created_at: Utc::now(),
        };
        self.push(row).await
    }

    /// Record an A/B preference across candidate attempts.
    ///
    /// `agreement` is computed here: did the human pick what the system's
    /// evaluator picked?
    #[allow(clippy::too_many_arguments)]
    pub async fn log_preference(
        &self,
        session_id: &str,
        cell_name: &str,
        cascade_id: Option<&str>,
        preferred_index: u32,
        system_winner_index: u32,
        mutation_applied: Option<&str>,
        notes: &str,
    ) -> Result<String, AnalyticsStoreError> {
        let row = EvaluationRow {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            cell_name: Some(cell_name.to_string()),
            cascade_id: cascade_id.map(str::to_string),
            evaluation_type: "preference".to_string(),
            is_good: None,
            preferred_candidate_index: Some(preferred_index),
            system_winner_index: Some(system_winner_index),
            agreement: Some(preferred_index == system_winner_index),
            output_text: None,
            mutation_applied: mutation_applied.map(str::to_string),
            flagged: false,
            flag_reason: None,
            notes: notes.to_string(),
            evaluator: "human".to_string(),
            created_at: Utc::now(),
        };
        self.push(row).await
    }

    /// Flag a session or output for review.
    pub async fn log_flag(
        &self,
        session_id: &str,
        cell_name: Option<&str>,
        flag_reason: &str,
        output: Option<&Value>,
    ) -> Result<String, AnalyticsStoreError> {
        let row = EvaluationRow {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            cell_name: cell_name.map(str::to_string),
            cascade_id: None,
            evaluation_type: "flag".to_string(),
            is_good: None,
            preferred_candidate_index: None,
            system_winner_index: None,
            agreement: None,
            output_text: output.map(Value::to_string),
            mutation_applied: None,
            flagged: true,
            flag_reason: Some(flag_reason.to_string()),
            notes: String::new(),
            evaluator: "human".to_string(),
            created_at: Utc::now(),
        };
        self.push(row).await
    }

    /// Force any buffered rows to storage.
    pub async fn flush(&self) -> Result<(), AnalyticsStoreError> {
        let drained: Vec<EvaluationRow> = {
            let mut buffer = self.buffer.lock();
            buffer.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }
        self.store.insert_evaluations(drained).await
    }

    async fn push(&self, row: EvaluationRow) -> Result<String, AnalyticsStoreError> {
        let id = row.id.clone();
        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.push(row);
            buffer.len() >= BUFFER_LIMIT
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::InMemoryAnalyticsStore;

    #[tokio::test]
    async fn preference_records_agreement() {
        let store = Arc::new(InMemoryAnalyticsStore::new());
        let log = EvaluationsLog::new(store.clone());
        log.log_preference("s", "gen", Some("demo"), 2, 2, None, "")
            .await
            .unwrap();
        log.log_preference("s", "gen", Some("demo"), 0, 1, None, "disagreed")
            .await
            .unwrap();
        log.flush().await.unwrap();

        let rows = store.evaluations_snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].agreement, Some(true));
        assert_eq!(rows[1].agreement, Some(false));
    }

    #[tokio::test]
    async fn buffer_flushes_at_limit() {
        let store = Arc::new(InMemoryAnalyticsStore::new());
        let log = EvaluationsLog::new(store.clone());
        for i in 0..BUFFER_LIMIT {
            log.log_binary("s", None, None, i % 2 == 0, None, "")
                .await
                .unwrap();
        }
        // The limit-th push flushed without an explicit flush call.
        assert_eq!(store.evaluations_snapshot().len(), BUFFER_LIMIT);
    }
}
