//! OpenRouter-compatible HTTP client.
//!
//! Implements all three provider traits against the `/chat/completions`,
//! `/embeddings`, and `/generation` endpoints. The generation endpoint is
//! what makes deferred cost reconciliation possible: the authoritative
//! `total_cost` and native token counts settle a few seconds after the
//! completion itself returns.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{
    ChatClient, ChatRequest, ChatResponse, CostFeed, EmbeddingClient, EmbeddingResponse,
    GenerationCost, ProviderError, TokenUsage, ToolInvocation,
};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// HTTP client for an OpenRouter-compatible provider.
pub struct OpenRouterClient {
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Deserialize)]
struct WireToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: Option<String>,
    function: WireToolCallFunction,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct WireCompletion {
    id: Option<String>,
    model: Option<String>,
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[async_trait]
impl ChatClient for OpenRouterClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey);
        }

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let response = self
            .http
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request(format!("{status}: {text}")));
        }

        let wire: WireCompletion = response
            .json()
            .await
            .map_err(|e| ProviderError::Payload(e.to_string()))?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Payload("no choices in completion".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments));
                ToolInvocation {
                    id: call.id.unwrap_or_else(crate::types::new_trace_id),
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(ChatResponse {
            request_id: wire.id,
            model: wire.model.unwrap_or(request.model),
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: wire.usage.map(|u| TokenUsage {
                tokens_in: u.prompt_tokens.unwrap_or(0),
                tokens_out: u.completion_tokens.unwrap_or(0),
            }),
        })
    }
}

#[derive(Deserialize)]
struct WireEmbeddingItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct WireEmbeddings {
    id: Option<String>,
    model: Option<String>,
    data: Vec<WireEmbeddingItem>,
}

#[async_trait]
impl EmbeddingClient for OpenRouterClient {
    async fn embed(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<EmbeddingResponse, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey);
        }
        let response = self
            .http
            .post(self.url("/embeddings"))
            .bearer_auth(&self.api_key)
            .json(&json!({"model": model, "input": texts}))
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request(format!("{status}: {text}")));
        }
        let wire: WireEmbeddings = response
            .json()
            .await
            .map_err(|e| ProviderError::Payload(e.to_string()))?;
        let embeddings: Vec<Vec<f32>> = wire.data.into_iter().map(|d| d.embedding).collect();
        let dim = embeddings.first().map(Vec::len).unwrap_or(0);
        Ok(EmbeddingResponse {
            embeddings,
            dim,
            model: wire.model.unwrap_or_else(|| model.to_string()),
            request_id: wire.id,
        })
    }
}

#[derive(Deserialize)]
struct WireGenerationData {
    total_cost: Option<f64>,
    native_tokens_prompt: Option<u64>,
    native_tokens_completion: Option<u64>,
    model: Option<String>,
    generation_time: Option<f64>,
}

#[derive(Deserialize)]
struct WireGeneration {
    data: Option<WireGenerationData>,
}

#[async_trait]
impl CostFeed for OpenRouterClient {
    async fn fetch(&self, request_id: &str) -> Result<Option<GenerationCost>, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey);
        }
        let response = self
            .http
            .get(self.url("/generation"))
            .query(&[("id", request_id)])
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(ProviderError::Request(status.to_string()));
        }
        let wire: WireGeneration = response
            .json()
            .await
            .map_err(|e| ProviderError::Payload(e.to_string()))?;
        Ok(wire.data.map(|data| GenerationCost {
            total_cost: data.total_cost.unwrap_or(0.0),
            tokens_in: data.native_tokens_prompt.unwrap_or(0),
            tokens_out: data.native_tokens_completion.unwrap_or(0),
            model: data.model,
            // The provider's server-side generation time beats any client
            // clock we could have taken.
            generation_time_ms: data.generation_time.map(|s| (s * 1000.0) as u64),
        }))
    }
}
