//! Provider abstractions: chat completions, embeddings, and the deferred
//! cost feed.
//!
//! The engine treats the LLM provider as an external collaborator. These
//! traits are the contract; one concrete HTTP client speaks the
//! OpenRouter-compatible API, and tests substitute scripted clients.

mod openrouter;

pub use openrouter::OpenRouterClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::Message;

/// Errors from provider interactions.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned an unexpected payload: {0}")]
    Payload(String),

    #[error("no API key configured")]
    MissingApiKey,
}

/// Token counts as reported at response time (the provider's authoritative
/// numbers arrive later through the cost feed).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// A tool exposed to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

/// A tool call requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One chat completion request.
#[derive(Clone, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Self::default()
        }
    }

    /// Request payload as JSON for `full_request_json` logging.
    #[must_use]
    pub fn to_log_value(&self) -> Value {
        serde_json::json!({
            "model": self.model,
            "messages": self.messages,
            "tools": self.tools.iter().map(|t| &t.name).collect::<Vec<_>>(),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }
}

/// One chat completion response.
#[derive(Clone, Debug, Default)]
pub struct ChatResponse {
    /// Provider request id, used to poll the cost feed.
    pub request_id: Option<String>,
    pub model: String,
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: Option<TokenUsage>,
}

/// Chat completion client.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Batch embedding response.
#[derive(Clone, Debug, Default)]
pub struct EmbeddingResponse {
    pub embeddings: Vec<Vec<f32>>,
    pub dim: usize,
    pub model: String,
    pub request_id: Option<String>,
}

/// Embedding client. One call embeds a whole batch.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String], model: &str)
        -> Result<EmbeddingResponse, ProviderError>;
}

/// Authoritative generation cost fetched after the fact.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationCost {
    pub total_cost: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model: Option<String>,
    pub generation_time_ms: Option<u64>,
}

/// Deferred cost lookup keyed by provider request id.
#[async_trait]
pub trait CostFeed: Send + Sync {
    /// `Ok(None)` means the provider has no data yet; the tracker retries
    /// on its own schedule.
    async fn fetch(&self, request_id: &str) -> Result<Option<GenerationCost>, ProviderError>;
}
