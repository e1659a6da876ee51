//! The dependency-injected service bundle.
//!
//! One `Services` value is constructed at process start and threaded
//! explicitly through the runner. No global singletons, no ambient context
//! variables: a cell sees exactly what its runner was given.

use std::sync::Arc;

use crate::analytics::{AnalyticsStore, InMemoryAnalyticsStore};
use crate::cascade::CascadeLibrary;
use crate::config::EngineConfig;
use crate::context::ContextManager;
use crate::cost::CostTracker;
use crate::event_bus::EventBus;
use crate::log::{InMemoryLogStore, LogStore};
use crate::provider::{ChatClient, CostFeed, EmbeddingClient};
use crate::rag::{ChunkStore, InMemoryChunkStore, RagIndexer};
use crate::tools::ToolRegistry;

/// Everything the engine needs, wired once.
pub struct Services {
    pub config: EngineConfig,
    pub bus: EventBus,
    pub log: Arc<dyn LogStore>,
    pub chunks: Arc<dyn ChunkStore>,
    pub analytics: Arc<dyn AnalyticsStore>,
    pub registry: ToolRegistry,
    pub cascades: CascadeLibrary,
    pub chat: Arc<dyn ChatClient>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub cost_tracker: Arc<CostTracker>,
    pub context: ContextManager,
    pub rag: RagIndexer,
}

impl Services {
    /// Build a service bundle from explicit parts.
    ///
    /// The cost tracker is constructed but not spawned; call
    /// [`CostTracker::spawn`] once a runtime exists, or drive it manually in
    /// tests.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        chat: Arc<dyn ChatClient>,
        embedder: Arc<dyn EmbeddingClient>,
        cost_feed: Arc<dyn CostFeed>,
        log: Arc<dyn LogStore>,
        chunks: Arc<dyn ChunkStore>,
        analytics: Arc<dyn AnalyticsStore>,
        registry: ToolRegistry,
        cascades: CascadeLibrary,
    ) -> Self {
        let bus = EventBus::default();
        let cost_tracker = Arc::new(CostTracker::new(
            cost_feed,
            Arc::clone(&log),
            bus.clone(),
            config.cost_settle_interval,
            config.cost_poll_interval,
        ));
        let context = ContextManager::new(
            Arc::clone(&chat),
            Arc::clone(&embedder),
            &config.utility_model,
            &config.default_embed_model,
        );
        let rag = RagIndexer::new(Arc::clone(&chunks), Arc::clone(&embedder));
        Self {
            config,
            bus,
            log,
            chunks,
            analytics,
            registry,
            cascades,
            chat,
            embedder,
            cost_tracker,
            context,
            rag,
        }
    }

    /// In-memory stores throughout, with the given provider clients. The
    /// default wiring for tests and embedded use.
    #[must_use]
    pub fn in_memory(
        config: EngineConfig,
        chat: Arc<dyn ChatClient>,
        embedder: Arc<dyn EmbeddingClient>,
        cost_feed: Arc<dyn CostFeed>,
    ) -> Self {
        let registry = ToolRegistry::new();
        crate::tools::interp::register_polyglot_tools(&registry);
        Self::new(
            config,
            chat,
            embedder,
            cost_feed,
            Arc::new(InMemoryLogStore::new()),
            Arc::new(InMemoryChunkStore::new()),
            Arc::new(InMemoryAnalyticsStore::new()),
            registry,
            CascadeLibrary::new(),
        )
    }
}
