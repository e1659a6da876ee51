//! Engine configuration loaded from the environment.
//!
//! One [`EngineConfig`] is built at process start (after `dotenvy` loads any
//! `.env` file) and handed to [`crate::runner::Services`]. Nothing in the
//! engine reads environment variables after construction.

use rustc_hash::FxHashMap;
use std::time::Duration;

/// Default character threshold for ephemeral RAG indexing (~6K tokens).
pub const DEFAULT_EPHEMERAL_THRESHOLD: usize = 25_000;
/// Default chunk size for ephemeral and directory RAG indexes.
pub const DEFAULT_CHUNK_SIZE: usize = 1_500;
/// Default chunk overlap.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Process-wide engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Provider API key (OpenRouter-compatible endpoint).
    pub provider_api_key: Option<String>,
    /// Provider base URL override.
    pub provider_base_url: Option<String>,
    /// Default chat model when a cell does not pin one.
    pub default_model: String,
    /// Cheap model used for mutations, auto-fix, smart search, and
    /// LLM-assisted context selection.
    pub utility_model: String,
    /// Default embedding model.
    pub default_embed_model: String,
    /// Ephemeral RAG size trigger in characters (strictly-greater-than).
    pub ephemeral_threshold: usize,
    /// Chunk size for RAG indexing.
    pub chunk_size: usize,
    /// Chunk overlap for RAG indexing.
    pub chunk_overlap: usize,
    /// How long the cost tracker waits before polling the provider.
    pub cost_settle_interval: Duration,
    /// Worker poll cadence for the cost tracker.
    pub cost_poll_interval: Duration,
    /// Post-hoc confidence scoring toggle (`RVBBIT_CONFIDENCE_ASSESSMENT_ENABLED`).
    pub confidence_assessment_enabled: bool,
    /// Per-message relevance scoring toggle (`RVBBIT_ENABLE_RELEVANCE_ANALYSIS`).
    pub relevance_analysis_enabled: bool,
    /// Active-training-set size for evolutionary views (`RVBBIT_WINNER_HISTORY_LIMIT`).
    pub winner_history_limit: usize,
    /// Background embedding worker toggle (`LARS_ENABLE_EMBEDDINGS`).
    pub embeddings_enabled: bool,
    /// Optional search backend URL (`LARS_ELASTICSEARCH_HOST`), passed through
    /// to external collaborators.
    pub elasticsearch_host: Option<String>,
    /// Input-token price per 1K tokens by model, for context attribution.
    pub model_prices: FxHashMap<String, f64>,
    /// Safety cap on total cell invocations per session (handoff loops are
    /// expected; runaway loops are not).
    pub max_cell_invocations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut model_prices = FxHashMap::default();
        model_prices.insert("openai/gpt-4o-mini".to_string(), 0.000_15);
        model_prices.insert("anthropic/claude-sonnet-4".to_string(), 0.003);
        Self {
            provider_api_key: None,
            provider_base_url: None,
            default_model: "openai/gpt-4o-mini".to_string(),
            utility_model: "openai/gpt-4o-mini".to_string(),
            default_embed_model: "openai/text-embedding-3-small".to_string(),
            ephemeral_threshold: DEFAULT_EPHEMERAL_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            cost_settle_interval: Duration::from_secs(5),
            cost_poll_interval: Duration::from_secs(1),
            confidence_assessment_enabled: false,
            relevance_analysis_enabled: false,
            winner_history_limit: 50,
            embeddings_enabled: false,
            elasticsearch_host: None,
            model_prices,
            max_cell_invocations: 10_000,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the process environment.
    ///
    /// Loads `.env` via `dotenvy` first (missing files are fine), then reads
    /// the `RVBBIT_*` and `LARS_*` variables documented in the crate root.
    #[must_use]
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(key) = std::env::var("RVBBIT_PROVIDER_API_KEY") {
            if !key.is_empty() {
                config.provider_api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("RVBBIT_PROVIDER_BASE_URL") {
            if !url.is_empty() {
                config.provider_base_url = Some(url);
            }
        }
        if let Ok(model) = std::env::var("RVBBIT_DEFAULT_MODEL") {
            if !model.is_empty() {
                config.default_model = model;
            }
        }
        if let Ok(model) = std::env::var("RVBBIT_UTILITY_MODEL") {
            if !model.is_empty() {
                config.utility_model = model;
            }
        }
        if let Ok(model) = std::env::var("RVBBIT_EMBED_MODEL") {
            if !model.is_empty() {
                config.default_embed_model = model;
            }
        }
        if let Some(threshold) = read_usize("RVBBIT_EPHEMERAL_THRESHOLD") {
            config.ephemeral_threshold = threshold;
        }
        if let Some(limit) = read_usize("RVBBIT_WINNER_HISTORY_LIMIT") {
            config.winner_history_limit = limit;
        }
        config.confidence_assessment_enabled = read_bool("RVBBIT_CONFIDENCE_ASSESSMENT_ENABLED");
        config.relevance_analysis_enabled = read_bool("RVBBIT_ENABLE_RELEVANCE_ANALYSIS");
        config.embeddings_enabled = read_bool("LARS_ENABLE_EMBEDDINGS");
        config.elasticsearch_host = std::env::var("LARS_ELASTICSEARCH_HOST")
            .ok()
            .filter(|v| !v.is_empty());

        config
    }

    /// Input-token price per 1K tokens for a model, if known.
    #[must_use]
    pub fn input_price_per_1k(&self, model: &str) -> Option<f64> {
        self.model_prices.get(model).copied()
    }
}

fn read_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let lowered = v.to_ascii_lowercase();
            matches!(lowered.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

fn read_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.ephemeral_threshold, 25_000);
        assert!(config.cost_settle_interval >= Duration::from_secs(1));
        assert!(!config.confidence_assessment_enabled);
    }
}
