//! Background embedding worker.
//!
//! When `LARS_ENABLE_EMBEDDINGS` is set, this worker periodically sweeps
//! the log for agent and tool-result rows without embeddings, embeds their
//! content in batches, and patches the vectors back on. Semantic context
//! selection and analytics get vectors without blocking the hot path.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::log::LogStore;
use crate::provider::EmbeddingClient;

/// Rows embedded per sweep.
const BATCH_SIZE: usize = 32;
/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// The embedding worker handle.
pub struct EmbeddingWorker {
    log: Arc<dyn LogStore>,
    embedder: Arc<dyn EmbeddingClient>,
    embed_model: String,
}

impl EmbeddingWorker {
    #[must_use]
    pub fn new(
        log: Arc<dyn LogStore>,
        embedder: Arc<dyn EmbeddingClient>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            log,
            embedder,
            embed_model: config.default_embed_model.clone(),
        }
    }

    /// Spawn the sweep loop when enabled; returns `None` otherwise.
    #[must_use]
    pub fn spawn_if_enabled(self, config: &EngineConfig) -> Option<JoinHandle<()>> {
        if !config.embeddings_enabled {
            return None;
        }
        Some(tokio::spawn(async move {
            loop {
                self.sweep_once().await;
                tokio::time::sleep(SWEEP_INTERVAL).await;
            }
        }))
    }

    /// One sweep: embed a batch of unembedded rows. Exposed for tests.
    pub async fn sweep_once(&self) -> usize {
        let rows = match self.log.rows_missing_embedding(BATCH_SIZE).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(target: "rvbbit::embeddings", error = %err, "sweep query failed");
                return 0;
            }
        };
        if rows.is_empty() {
            return 0;
        }

        let texts: Vec<String> = rows
            .iter()
            .map(|row| {
                let text = row.content_json.to_string();
                // Embedding payloads stay bounded; the content hash already
                // identifies the full row.
                text.chars().take(8_000).collect()
            })
            .collect();
        let embedded = match self.embedder.embed(&texts, &self.embed_model).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(target: "rvbbit::embeddings", error = %err, "batch embed failed");
                return 0;
            }
        };

        let mut patched = 0usize;
        for (row, embedding) in rows.iter().zip(embedded.embeddings) {
            match self.log.patch_embedding(&row.trace_id, embedding).await {
                Ok(()) => patched += 1,
                Err(err) => {
                    tracing::warn!(
                        target: "rvbbit::embeddings",
                        trace_id = %row.trace_id,
                        error = %err,
                        "embedding patch failed"
                    );
                }
            }
        }
        tracing::debug!(target: "rvbbit::embeddings", patched, "sweep complete");
        patched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{InMemoryLogStore, LogRow};
    use crate::provider::{EmbeddingResponse, ProviderError};
    use crate::types::NodeType;
    use async_trait::async_trait;
    use serde_json::json;

    struct OnesEmbedder;

    #[async_trait]
    impl crate::provider::EmbeddingClient for OnesEmbedder {
        async fn embed(
            &self,
            texts: &[String],
            model: &str,
        ) -> Result<EmbeddingResponse, ProviderError> {
            Ok(EmbeddingResponse {
                embeddings: texts.iter().map(|_| vec![1.0, 0.0]).collect(),
                dim: 2,
                model: model.to_string(),
                request_id: None,
            })
        }
    }

    #[tokio::test]
    async fn sweep_embeds_agent_and_tool_result_rows() {
        let log = Arc::new(InMemoryLogStore::new());
        log.append(LogRow::new("s", NodeType::Agent, "assistant", json!("answer")))
            .await
            .unwrap();
        log.append(LogRow::new("s", NodeType::CostUpdate, "system", json!({})))
            .await
            .unwrap();

        let worker = EmbeddingWorker::new(
            log.clone(),
            Arc::new(OnesEmbedder),
            &EngineConfig::default(),
        );
        let patched = worker.sweep_once().await;
        assert_eq!(patched, 1);

        let rows = log.rows_for_session("s").await.unwrap();
        let agent = rows.iter().find(|r| r.node_type == NodeType::Agent).unwrap();
        assert_eq!(agent.content_embedding, Some(vec![1.0, 0.0]));
        // A second sweep finds nothing left to do.
        assert_eq!(worker.sweep_once().await, 0);
    }
}
