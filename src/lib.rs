//! # rvbbit: LLM cascade orchestration
//!
//! rvbbit executes declarative **cascades**: directed graphs of cells that
//! mix LLM invocations, deterministic tool calls, and human checkpoints
//! into verified structured outputs. Every run (a *session*) produces a
//! complete, replayable, cost-attributed execution trace.
//!
//! ## Core concepts
//!
//! - **Cascade**: a YAML/JSON document of cells with handoffs and routing
//! - **Cell**: one node, either LLM (`instructions`), deterministic
//!   (`tool`), SQL-mapping (`for_each_row`), or screen (`htmx`)
//! - **Echo**: the in-memory session record (history, lineage, state,
//!   outputs, checkpoints)
//! - **Candidates**: fan-out of N variant attempts with mutation,
//!   prefiltering, and evaluator selection
//! - **Wards**: validators at pre/post/turn positions with blocking,
//!   advisory, or retry semantics
//! - **Ephemeral RAG**: per-cell indexing of oversized content behind
//!   generated search tools
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvbbit::cascade::Cascade;
//! use rvbbit::config::EngineConfig;
//! use rvbbit::provider::OpenRouterClient;
//! use rvbbit::runner::{CascadeRunner, Services};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env();
//! let client = Arc::new(OpenRouterClient::new(
//!     config.provider_api_key.clone().unwrap_or_default(),
//!     config.provider_base_url.clone(),
//! ));
//! let services = Arc::new(Services::in_memory(
//!     config,
//!     client.clone(),
//!     client.clone(),
//!     client,
//! ));
//! services.cost_tracker.spawn();
//!
//! let cascade = services.cascades.register(Cascade::from_str(r#"
//! cascade_id: hello
//! cells:
//!   - name: greet
//!     instructions: "Say hello to {{ input.name }}"
//! "#)?);
//!
//! let runner = CascadeRunner::new(services);
//! let outcome = runner.run(cascade, serde_json::json!({"name": "world"})).await?;
//! println!("{:?}", outcome.is_completed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`cascade`] - Document model, validation, and the cascade library
//! - [`runner`] - The graph executor, hooks, and suspension/resume
//! - [`candidates`] - Multi-sample fan-out and evaluation
//! - [`validators`] - Polyglot validator dispatch and wards
//! - [`context`] - Inter-cell context selection and token budgets
//! - [`rag`] - Chunking, directory indexes, and ephemeral RAG
//! - [`cost`] - Deferred provider cost reconciliation
//! - [`analytics`] - Post-session baselines, Z-scores, context attribution
//! - [`event_bus`] - Lifecycle event fan-out
//! - [`log`] - The wide append-only session log
//!
//! ## Environment
//!
//! Selected variables read by [`config::EngineConfig::from_env`]:
//! `RVBBIT_PROVIDER_API_KEY`, `RVBBIT_DEFAULT_MODEL`,
//! `RVBBIT_CONFIDENCE_ASSESSMENT_ENABLED`, `RVBBIT_ENABLE_RELEVANCE_ANALYSIS`,
//! `RVBBIT_WINNER_HISTORY_LIMIT`, `LARS_ENABLE_EMBEDDINGS`,
//! `LARS_ELASTICSEARCH_HOST`.

pub mod analytics;
pub mod candidates;
pub mod cascade;
pub mod config;
pub mod context;
pub mod cost;
pub mod echo;
pub mod evals;
pub mod event_bus;
pub mod hashes;
pub mod log;
pub mod message;
pub mod provider;
pub mod rag;
pub mod runner;
pub mod telemetry;
pub mod template;
pub mod tools;
pub mod types;
pub mod validators;
pub mod workers;
