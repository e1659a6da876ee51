//! Post-session analytics: aggregates, baselines, Z-scores, and context
//! attribution.
//!
//! The worker runs after a session terminates (success or failure). It
//! waits briefly for cost rows to settle, rolls the session up, compares it
//! against three baseline tiers (global, cluster, genus), flags outliers at
//! |z| > 2, splits each LLM cell's cost into injected-context vs new
//! generation, and writes everything to the analytics store. Original logs
//! are never mutated.

mod store;

pub use store::{
    AnalyticsStore, AnalyticsStoreError, CascadeAnalyticsRow, CellAnalyticsRow,
    ContextBreakdownRow, EvaluationRow, InMemoryAnalyticsStore, SessionRecord,
};

use chrono::Utc;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::log::LogRow;
use crate::message::Message;
use crate::provider::ChatRequest;
use crate::runner::Services;
use crate::types::NodeType;

/// How long the worker waits for cost rows before proceeding without them.
const COST_WAIT_BUDGET: Duration = Duration::from_secs(10);
const COST_WAIT_STEP: Duration = Duration::from_millis(500);
/// Baseline sample size per tier.
const BASELINE_LIMIT: usize = 100;
/// Outlier threshold on the Z-score.
const OUTLIER_Z: f64 = 2.0;

/// Errors from the analytics pass.
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error(transparent)]
    Log(#[from] crate::log::LogStoreError),
    #[error(transparent)]
    Store(#[from] AnalyticsStoreError),
}

/// Mean and stddev for one metric in one baseline tier.
#[derive(Clone, Copy, Debug, Default)]
struct Baseline {
    mean: f64,
    stddev: f64,
    samples: usize,
}

fn baseline_of(values: &[f64]) -> Baseline {
    if values.is_empty() {
        return Baseline::default();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Baseline {
        mean,
        stddev: variance.sqrt(),
        samples: values.len(),
    }
}

/// Z-score with a safe divide: zero stddev yields zero, never NaN.
#[must_use]
pub fn safe_z(value: f64, mean: f64, stddev: f64) -> f64 {
    if stddev == 0.0 || !stddev.is_finite() {
        return 0.0;
    }
    (value - mean) / stddev
}

/// Input complexity classification.
#[derive(Clone, Debug, PartialEq)]
pub struct InputComplexity {
    pub score: f64,
    pub category: &'static str,
    pub fingerprint: String,
    pub char_count: usize,
    pub estimated_tokens: usize,
}

/// Score input complexity from size, nesting depth, and array volume.
#[must_use]
pub fn compute_input_complexity(input: &Value) -> InputComplexity {
    let serialized = input.to_string();
    let char_count = if input.is_null() { 0 } else { serialized.len() };
    let estimated_tokens = char_count / 4;
    let depth = json_depth(input, 0);
    let array_items = count_array_items(input);

    let score = ((char_count as f64 / 10_000.0) * 0.4
        + (estimated_tokens as f64 / 2_500.0) * 0.3
        + (depth as f64 / 10.0) * 0.15
        + (array_items as f64 / 1_000.0) * 0.15)
        .min(1.0);

    let category = if score < 0.1 {
        "tiny"
    } else if score < 0.3 {
        "small"
    } else if score < 0.6 {
        "medium"
    } else if score < 0.85 {
        "large"
    } else {
        "huge"
    };

    InputComplexity {
        score,
        category,
        fingerprint: crate::hashes::input_fingerprint(input),
        char_count,
        estimated_tokens,
    }
}

fn json_depth(value: &Value, current: usize) -> usize {
    match value {
        Value::Object(map) => map
            .values()
            .map(|v| json_depth(v, current + 1))
            .max()
            .unwrap_or(current + 1),
        Value::Array(items) => items
            .iter()
            .map(|v| json_depth(v, current + 1))
            .max()
            .unwrap_or(current + 1),
        _ => current,
    }
}

fn count_array_items(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len() + items.iter().map(count_array_items).sum::<usize>(),
        Value::Object(map) => map.values().map(count_array_items).sum(),
        _ => 0,
    }
}

/// The post-session worker.
pub struct AnalyticsWorker {
    services: Arc<Services>,
}

impl AnalyticsWorker {
    #[must_use]
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Analyze one terminated session.
    pub async fn analyze(&self, session_id: &str, cascade_id: &str) -> Result<(), AnalyticsError> {
        let rows = self.wait_for_cost_rows(session_id).await?;
        if rows.is_empty() {
            tracing::debug!(target: "rvbbit::analytics", session = session_id, "no rows to analyze");
            return Ok(());
        }

        // Session aggregates.
        let total_cost: f64 = rows.iter().filter_map(|r| r.cost).sum();
        let min_ts = rows.iter().map(|r| r.timestamp).min();
        let max_ts = rows.iter().map(|r| r.timestamp).max();
        let duration_ms = match (min_ts, max_ts) {
            (Some(min), Some(max)) => (max - min).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        let total_tokens: u64 = rows
            .iter()
            .map(|r| r.tokens_in.unwrap_or(0) + r.tokens_out.unwrap_or(0))
            .sum();
        let message_count = rows.len() as u64;
        let cells: FxHashSet<&str> = rows
            .iter()
            .filter_map(|r| r.cell_name.as_deref())
            .collect();
        let error_count = rows
            .iter()
            .filter(|r| {
                r.node_type == NodeType::System
                    && r.content_json.get("kind").is_some()
                    && r.content_json.get("reason").is_some()
            })
            .count() as u64;
        let candidate_count = rows
            .iter()
            .filter(|r| r.node_type == NodeType::SoundingAttempt)
            .count() as u64;
        let winner_candidate_index = rows
            .iter()
            .filter(|r| r.is_winner == Some(true))
            .filter_map(|r| r.candidate_index)
            .next();

        // Input complexity from the session's first user row.
        let input_value = rows
            .iter()
            .find(|r| r.node_type == NodeType::User)
            .map(|r| r.content_json.clone())
            .unwrap_or(Value::Null);
        let complexity = compute_input_complexity(&input_value);
        let genus_hash = rows.iter().find_map(|r| r.genus_hash.clone());

        // Three-tier baselines from prior sessions.
        let prior = self
            .services
            .analytics
            .cascade_rows(cascade_id, BASELINE_LIMIT)
            .await?;
        let global: Vec<&CascadeAnalyticsRow> = prior.iter().collect();
        let cluster: Vec<&CascadeAnalyticsRow> = prior
            .iter()
            .filter(|r| r.input_category == complexity.category)
            .collect();
        let genus_tier: Vec<&CascadeAnalyticsRow> = match &genus_hash {
            Some(genus) => prior
                .iter()
                .filter(|r| r.genus_hash.as_deref() == Some(genus.as_str()))
                .collect(),
            None => Vec::new(),
        };

        // The cluster tier is preferred; fall back outward when it is empty.
        let (tier_rows, tier_name) = if !cluster.is_empty() {
            (&cluster, "cluster")
        } else if !genus_tier.is_empty() {
            (&genus_tier, "genus")
        } else {
            (&global, "global")
        };
        let cost_baseline = baseline_of(&tier_rows.iter().map(|r| r.total_cost).collect::<Vec<_>>());
        let duration_baseline =
            baseline_of(&tier_rows.iter().map(|r| r.duration_ms as f64).collect::<Vec<_>>());
        let tokens_baseline =
            baseline_of(&tier_rows.iter().map(|r| r.total_tokens as f64).collect::<Vec<_>>());

        let cost_z = safe_z(total_cost, cost_baseline.mean, cost_baseline.stddev);
        let duration_z = safe_z(
            duration_ms as f64,
            duration_baseline.mean,
            duration_baseline.stddev,
        );
        let tokens_z = safe_z(
            total_tokens as f64,
            tokens_baseline.mean,
            tokens_baseline.stddev,
        );
        let is_outlier = cost_baseline.samples >= 3
            && (cost_z.abs() > OUTLIER_Z
                || duration_z.abs() > OUTLIER_Z
                || tokens_z.abs() > OUTLIER_Z);

        // Per-cell analytics and context attribution.
        let (cell_rows, breakdowns, total_context_cost, total_new_cost) = self
            .analyze_cells(session_id, cascade_id, &rows)
            .await?;

        // Optional confidence pass over the final output.
        let (confidence_score, confidence_reasoning) =
            if self.services.config.confidence_assessment_enabled {
                self.assess_confidence(&rows).await
            } else {
                (None, None)
            };

        self.services
            .analytics
            .insert_cascade_row(CascadeAnalyticsRow {
                session_id: session_id.to_string(),
                cascade_id: cascade_id.to_string(),
                genus_hash,
                input_category: complexity.category.to_string(),
                input_fingerprint: complexity.fingerprint,
                total_cost,
                duration_ms,
                total_tokens,
                message_count,
                cell_count: cells.len() as u64,
                error_count,
                candidate_count,
                winner_candidate_index,
                cost_z_score: cost_z,
                duration_z_score: duration_z,
                tokens_z_score: tokens_z,
                is_outlier,
                baseline_tier: tier_name.to_string(),
                total_context_cost,
                total_new_cost,
                confidence_score,
                confidence_reasoning,
                created_at: Utc::now(),
            })
            .await?;
        self.services.analytics.insert_cell_rows(cell_rows).await?;
        self.services
            .analytics
            .insert_context_breakdown(breakdowns)
            .await?;

        Ok(())
    }

    /// Poll the log until cost rows appear or the wait budget is spent.
    ///
    /// Deterministic and free-model sessions never get cost rows; the wait
    /// ends early once every agent row is settled or no agent rows exist.
    async fn wait_for_cost_rows(&self, session_id: &str) -> Result<Vec<LogRow>, AnalyticsError> {
        let mut waited = Duration::ZERO;
        loop {
            let rows = self.services.log.rows_for_session(session_id).await?;
            let agent_rows: Vec<&LogRow> = rows
                .iter()
                .filter(|r| r.node_type == NodeType::Agent)
                .collect();
            if agent_rows.is_empty() {
                return Ok(rows);
            }
            let settled = agent_rows.iter().all(|r| r.cost.is_some())
                || rows.iter().any(|r| r.node_type == NodeType::CostUpdate);
            if settled || waited >= COST_WAIT_BUDGET {
                return Ok(rows);
            }
            tokio::time::sleep(COST_WAIT_STEP).await;
            waited += COST_WAIT_STEP;
        }
    }

    #[allow(clippy::type_complexity)]
    async fn analyze_cells(
        &self,
        session_id: &str,
        cascade_id: &str,
        rows: &[LogRow],
    ) -> Result<(Vec<CellAnalyticsRow>, Vec<ContextBreakdownRow>, f64, f64), AnalyticsError> {
        let mut by_cell: FxHashMap<String, Vec<&LogRow>> = FxHashMap::default();
        for row in rows {
            if let Some(cell) = &row.cell_name {
                by_cell.entry(cell.clone()).or_default().push(row);
            }
        }

        // Baseline tokens_in for LLM calls with no injected context; those
        // calls approximate "instructions only".
        let empty_context_tokens: Vec<f64> = rows
            .iter()
            .filter(|r| r.node_type == NodeType::Agent && r.context_hashes.is_empty())
            .filter_map(|r| r.tokens_in.map(|t| t as f64))
            .collect();
        let empty_baseline = baseline_of(&empty_context_tokens);

        // Hash to source row lookup for the per-message breakdown.
        let by_hash: FxHashMap<&str, &LogRow> = rows
            .iter()
            .map(|r| (r.content_hash.as_str(), r))
            .collect();

        let mut cell_rows = Vec::new();
        let mut breakdowns = Vec::new();
        let mut total_context_cost = 0.0;
        let mut total_new_cost = 0.0;

        for (cell_name, cell_log) in &by_cell {
            let cost: f64 = cell_log.iter().filter_map(|r| r.cost).sum();
            let tokens_in: u64 = cell_log.iter().filter_map(|r| r.tokens_in).sum();
            let tokens_out: u64 = cell_log.iter().filter_map(|r| r.tokens_out).sum();
            let duration_ms: u64 = cell_log.iter().filter_map(|r| r.duration_ms).max().unwrap_or(0);
            let llm_calls = cell_log
                .iter()
                .filter(|r| r.node_type == NodeType::Agent)
                .count() as u64;
            let species_hash = cell_log.iter().find_map(|r| r.species_hash.clone());

            // Context attribution: tokens_in beyond the empty-context
            // baseline estimate the injected context.
            let agent_calls: Vec<&&LogRow> = cell_log
                .iter()
                .filter(|r| r.node_type == NodeType::Agent)
                .collect();
            let mut context_cost = 0.0;
            let mut new_cost = 0.0;
            if !agent_calls.is_empty() {
                let avg_tokens_in: f64 = agent_calls
                    .iter()
                    .filter_map(|r| r.tokens_in.map(|t| t as f64))
                    .sum::<f64>()
                    / agent_calls.len() as f64;
                let excess = (avg_tokens_in - empty_baseline.mean).max(0.0);
                let model = agent_calls
                    .iter()
                    .find_map(|r| r.model_actual.clone().or_else(|| r.model_requested.clone()))
                    .unwrap_or_default();
                let price = self
                    .services
                    .config
                    .input_price_per_1k(&model)
                    .unwrap_or(0.0);
                context_cost = (excess / 1000.0) * price * agent_calls.len() as f64;
                new_cost = (cost - context_cost).max(0.0);
                total_context_cost += context_cost;
                total_new_cost += new_cost;

                // Per-message breakdown from the first agent call's hashes.
                if let Some(first_call) = agent_calls.first() {
                    let cell_cost = cost.max(f64::EPSILON);
                    for hash in &first_call.context_hashes {
                        if let Some(source) = by_hash.get(hash.as_str()) {
                            let tokens =
                                (source.content_json.to_string().len() / 4) as u64;
                            let msg_cost = (tokens as f64 / 1000.0) * price;
                            breakdowns.push(ContextBreakdownRow {
                                session_id: session_id.to_string(),
                                cell_name: cell_name.clone(),
                                message_hash: hash.clone(),
                                source_cell: source.cell_name.clone(),
                                role: source.role.clone(),
                                tokens,
                                cost: msg_cost,
                                pct_of_cell_cost: (msg_cost / cell_cost) * 100.0,
                                relevance_score: None,
                                relevance_reasoning: None,
                            });
                        }
                    }
                }
            }

            // Most specific baseline: same cell and species in this cascade.
            let prior = self
                .services
                .analytics
                .cell_rows(cascade_id, cell_name, BASELINE_LIMIT)
                .await?;
            let matched: Vec<&CellAnalyticsRow> = prior
                .iter()
                .filter(|r| {
                    species_hash.is_none() || r.species_hash == species_hash
                })
                .collect();
            let cost_baseline =
                baseline_of(&matched.iter().map(|r| r.cost).collect::<Vec<_>>());
            let duration_baseline =
                baseline_of(&matched.iter().map(|r| r.duration_ms as f64).collect::<Vec<_>>());
            let cost_z = safe_z(cost, cost_baseline.mean, cost_baseline.stddev);
            let duration_z = safe_z(
                duration_ms as f64,
                duration_baseline.mean,
                duration_baseline.stddev,
            );

            cell_rows.push(CellAnalyticsRow {
                session_id: session_id.to_string(),
                cascade_id: cascade_id.to_string(),
                cell_name: cell_name.clone(),
                species_hash,
                cost,
                duration_ms,
                tokens_in,
                tokens_out,
                llm_calls,
                cost_z_score: cost_z,
                duration_z_score: duration_z,
                is_outlier: cost_baseline.samples >= 3
                    && (cost_z.abs() > OUTLIER_Z || duration_z.abs() > OUTLIER_Z),
                context_cost,
                new_cost,
                created_at: Utc::now(),
            });
        }

        // Optional second pass: score injected messages for downstream
        // relevance.
        if self.services.config.relevance_analysis_enabled && !breakdowns.is_empty() {
            self.score_relevance(rows, &mut breakdowns).await;
        }

        Ok((cell_rows, breakdowns, total_context_cost, total_new_cost))
    }

    async fn score_relevance(&self, rows: &[LogRow], breakdowns: &mut [ContextBreakdownRow]) {
        let final_output = rows
            .iter()
            .rev()
            .find(|r| r.node_type == NodeType::Agent)
            .map(|r| r.content_json.to_string())
            .unwrap_or_default();
        let by_hash: FxHashMap<&str, &LogRow> = rows
            .iter()
            .map(|r| (r.content_hash.as_str(), r))
            .collect();

        let listing: Vec<String> = breakdowns
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                by_hash.get(b.message_hash.as_str()).map(|source| {
                    let preview: String =
                        source.content_json.to_string().chars().take(200).collect();
                    format!("[{i}] {preview}")
                })
            })
            .collect();
        let prompt = format!(
            "Final output:\n{final_output}\n\nInjected context messages:\n{}\n\n\
             Score each message 0.0-1.0 for how much it actually contributed to the \
             final output. Reply with ONLY JSON: \
             [{{\"index\": <i>, \"score\": <0-1>, \"reasoning\": \"...\"}}]",
            listing.join("\n")
        );
        let Ok(response) = self
            .services
            .chat
            .complete(ChatRequest::new(
                &self.services.config.utility_model,
                vec![Message::user(prompt)],
            ))
            .await
        else {
            return;
        };
        let Ok(parsed) = serde_json::from_str::<Vec<Value>>(response.content.trim()) else {
            return;
        };
        for item in parsed {
            let Some(index) = item.get("index").and_then(Value::as_u64) else {
                continue;
            };
            if let Some(breakdown) = breakdowns.get_mut(index as usize) {
                breakdown.relevance_score = item.get("score").and_then(Value::as_f64);
                breakdown.relevance_reasoning = item
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
    }

    async fn assess_confidence(&self, rows: &[LogRow]) -> (Option<f64>, Option<String>) {
        let final_output = rows
            .iter()
            .rev()
            .find(|r| r.node_type == NodeType::Agent || r.node_type == NodeType::System)
            .map(|r| r.content_json.to_string())
            .unwrap_or_default();
        if final_output.is_empty() {
            return (None, None);
        }
        let prompt = format!(
            "Assess the confidence that this output correctly satisfies its task. \
             Reply with ONLY JSON: {{\"score\": <0.0-1.0>, \"reasoning\": \"...\"}}\n\n\
             Output:\n{final_output}"
        );
        let Ok(response) = self
            .services
            .chat
            .complete(ChatRequest::new(
                &self.services.config.utility_model,
                vec![Message::user(prompt)],
            ))
            .await
        else {
            return (None, None);
        };
        let Ok(parsed) = serde_json::from_str::<Value>(response.content.trim()) else {
            return (None, None);
        };
        (
            parsed.get("score").and_then(Value::as_f64),
            parsed
                .get("reasoning")
                .and_then(Value::as_str)
                .map(str::to_string),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn zero_stddev_yields_zero_z() {
        assert_eq!(safe_z(5.0, 5.0, 0.0), 0.0);
        assert_eq!(safe_z(100.0, 5.0, 0.0), 0.0);
        assert!(safe_z(10.0, 5.0, 2.5).is_finite());
        assert_eq!(safe_z(10.0, 5.0, 2.5), 2.0);
    }

    #[test]
    fn complexity_categories_scale_with_size() {
        let tiny = compute_input_complexity(&json!({"q": "hi"}));
        assert_eq!(tiny.category, "tiny");

        let huge_payload: Vec<Value> = (0..2000).map(|i| json!({"row": i, "text": "x".repeat(40)})).collect();
        let huge = compute_input_complexity(&json!({"rows": huge_payload}));
        assert_eq!(huge.category, "huge");
        assert!(huge.score > tiny.score);
    }

    #[test]
    fn complexity_of_null_is_tiny() {
        let complexity = compute_input_complexity(&Value::Null);
        assert_eq!(complexity.category, "tiny");
        assert_eq!(complexity.char_count, 0);
        assert_eq!(complexity.fingerprint, "empty");
    }
}
