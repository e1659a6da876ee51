//! Shared fixtures: scripted provider clients and prewired services.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rvbbit::config::EngineConfig;
use rvbbit::log::LogStore;
use rvbbit::provider::{
    ChatClient, ChatRequest, ChatResponse, CostFeed, EmbeddingClient, EmbeddingResponse,
    GenerationCost, ProviderError, TokenUsage,
};
use rvbbit::runner::Services;
use rvbbit::tools::{ToolError, ToolKind, ToolRegistry};

/// Chat client driven by a responder closure; records every request.
pub struct ScriptedChat {
    responder: Box<dyn Fn(&ChatRequest, usize) -> ChatResponse + Send + Sync>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
}

impl ScriptedChat {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&ChatRequest, usize) -> ChatResponse + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Always answer with the same content.
    pub fn constant(content: &str) -> Arc<Self> {
        let content = content.to_string();
        Self::new(move |_request, _call| ChatResponse {
            content: content.clone(),
            model: "scripted".to_string(),
            usage: Some(TokenUsage {
                tokens_in: 10,
                tokens_out: 5,
            }),
            ..ChatResponse::default()
        })
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for ScriptedChat {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let response = (self.responder)(&request, call);
        self.requests.lock().push(request);
        Ok(response)
    }
}

/// Deterministic embedder: a text's vector is derived from its bytes, so
/// identical text embeds identically. Counts provider calls.
pub struct StaticEmbedder {
    pub dim: usize,
    calls: AtomicUsize,
}

impl StaticEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dim: 8,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn with_dim(dim: usize) -> Arc<Self> {
        Arc::new(Self {
            dim,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dim] += f32::from(byte) / 255.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingClient for StaticEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<EmbeddingResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EmbeddingResponse {
            embeddings: texts.iter().map(|t| self.embed_one(t)).collect(),
            dim: self.dim,
            model: model.to_string(),
            request_id: None,
        })
    }
}

/// Cost feed backed by a shared map; tests insert entries when the
/// "provider" has settled.
#[derive(Default)]
pub struct StubCostFeed {
    costs: Mutex<std::collections::HashMap<String, GenerationCost>>,
}

impl StubCostFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn settle(&self, request_id: &str, cost: GenerationCost) {
        self.costs.lock().insert(request_id.to_string(), cost);
    }
}

#[async_trait]
impl CostFeed for StubCostFeed {
    async fn fetch(&self, request_id: &str) -> Result<Option<GenerationCost>, ProviderError> {
        Ok(self.costs.lock().get(request_id).cloned())
    }
}

/// A cost feed that always errors, for the cost=null path.
pub struct FailingCostFeed;

#[async_trait]
impl CostFeed for FailingCostFeed {
    async fn fetch(&self, _request_id: &str) -> Result<Option<GenerationCost>, ProviderError> {
        Err(ProviderError::Request("provider unreachable".to_string()))
    }
}

/// Engine config tuned for tests: tiny settle interval, small ephemeral
/// threshold kept at the default unless a test overrides it.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.cost_settle_interval = Duration::from_millis(50);
    config.cost_poll_interval = Duration::from_millis(20);
    config
}

pub struct TestHarness {
    pub services: Arc<Services>,
    pub chat: Arc<ScriptedChat>,
    pub embedder: Arc<StaticEmbedder>,
    pub cost_feed: Arc<StubCostFeed>,
    /// Concrete handle onto the analytics store for snapshot assertions.
    pub analytics: Arc<rvbbit::analytics::InMemoryAnalyticsStore>,
}

/// Prewired in-memory services around a scripted chat client.
pub fn harness(chat: Arc<ScriptedChat>) -> TestHarness {
    harness_with_config(chat, test_config())
}

pub fn harness_with_config(chat: Arc<ScriptedChat>, config: EngineConfig) -> TestHarness {
    rvbbit::telemetry::init();
    let embedder = StaticEmbedder::new();
    let cost_feed = StubCostFeed::new();
    let analytics = Arc::new(rvbbit::analytics::InMemoryAnalyticsStore::new());
    let registry = ToolRegistry::new();
    rvbbit::tools::interp::register_polyglot_tools(&registry);
    let services = Arc::new(Services::new(
        config,
        chat.clone(),
        embedder.clone(),
        cost_feed.clone(),
        Arc::new(rvbbit::log::InMemoryLogStore::new()),
        Arc::new(rvbbit::rag::InMemoryChunkStore::new()),
        analytics.clone(),
        registry,
        rvbbit::cascade::CascadeLibrary::new(),
    ));
    TestHarness {
        services,
        chat,
        embedder,
        cost_feed,
        analytics,
    }
}

/// In-memory log snapshot helper: services are built on InMemoryLogStore,
/// so reads go through the trait.
pub async fn session_rows(
    services: &Services,
    session_id: &str,
) -> Vec<rvbbit::log::LogRow> {
    services.log.rows_for_session(session_id).await.unwrap()
}

/// Register a simple echo-style function tool.
pub fn register_json_tool<F>(registry: &ToolRegistry, name: &str, f: F)
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync + Clone + 'static,
{
    let tool_name = name.to_string();
    registry.register_fn(
        name,
        &format!("test tool {name}"),
        json!({"type": "object"}),
        ToolKind::Function,
        move |args: Value| {
            let f = f.clone();
            let tool_name = tool_name.clone();
            async move {
                f(args).map_err(|message| ToolError::Execution {
                    name: tool_name,
                    message,
                })
            }
        },
    );
}

/// Register a validator tool returning `{valid, reason}` from a predicate
/// on the content string.
pub fn register_content_validator<F>(registry: &ToolRegistry, name: &str, predicate: F)
where
    F: Fn(&str) -> (bool, String) + Send + Sync + Clone + 'static,
{
    registry.register_fn(
        name,
        &format!("test validator {name}"),
        json!({"type": "object"}),
        ToolKind::Validator,
        move |args: Value| {
            let predicate = predicate.clone();
            async move {
                let content = args
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let (valid, reason) = predicate(content);
                Ok(json!({"valid": valid, "reason": reason}))
            }
        },
    );
}
