//! The typed tool registry.
//!
//! Tools are resolved at configuration time into explicit registrations
//! rather than discovered dynamically. A registration is one of:
//!
//! - **Function**: an async Rust callable with a declared schema.
//! - **Validator**: a function whose result must normalize to
//!   `{valid, reason}`.
//! - **CascadeRef**: a named cascade executed as a tool (installed by the
//!   runner, which owns cascade execution).

use futures_util::future::BoxFuture;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::provider::ToolSchema;

/// Errors from tool resolution and execution.
#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    #[error("unknown tool '{name}'")]
    #[diagnostic(
        code(rvbbit::tools::unknown),
        help("Register the tool before running the cascade, or check the spelling in the cell's `tool` field.")
    )]
    Unknown { name: String },

    #[error("tool '{name}' failed: {message}")]
    #[diagnostic(code(rvbbit::tools::execution))]
    Execution { name: String, message: String },

    #[error("tool '{name}' timed out after {seconds:.1}s")]
    #[diagnostic(code(rvbbit::tools::timeout))]
    Timeout { name: String, seconds: f64 },

    #[error("invalid arguments for tool '{name}': {message}")]
    #[diagnostic(code(rvbbit::tools::args))]
    InvalidArgs { name: String, message: String },
}

/// What a registration is, beyond its callable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolKind {
    Function,
    Validator,
    /// Delegates to a named cascade; the runner installs the callable.
    CascadeRef(String),
}

type ToolRunner = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

/// One registered tool.
#[derive(Clone)]
pub struct RegisteredTool {
    pub schema: ToolSchema,
    pub kind: ToolKind,
    run: ToolRunner,
}

impl RegisteredTool {
    pub async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        (self.run)(args).await
    }
}

/// Thread-safe registry of tools available to cells and validators.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    inner: Arc<RwLock<FxHashMap<String, RegisteredTool>>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async function tool.
    pub fn register_fn<F, Fut>(
        &self,
        name: &str,
        description: &str,
        parameters: Value,
        kind: ToolKind,
        f: F,
    ) where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let runner: ToolRunner = Arc::new(move |args| Box::pin(f(args)));
        let tool = RegisteredTool {
            schema: ToolSchema {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
            kind,
            run: runner,
        };
        self.inner.write().insert(name.to_string(), tool);
    }

    /// Fetch a registration by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<RegisteredTool> {
        self.inner.read().get(name).cloned()
    }

    /// Resolve or fail with [`ToolError::Unknown`].
    pub fn resolve(&self, name: &str) -> Result<RegisteredTool, ToolError> {
        self.get(name).ok_or_else(|| ToolError::Unknown {
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    /// Schemas for a set of declared tool names, skipping unknowns.
    #[must_use]
    pub fn schemas_for(&self, names: &[String]) -> Vec<ToolSchema> {
        let inner = self.inner.read();
        names
            .iter()
            .filter_map(|name| inner.get(name).map(|tool| tool.schema.clone()))
            .collect()
    }

    /// All registered names, for diagnostics.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_and_invoke() {
        let registry = ToolRegistry::new();
        registry.register_fn(
            "double",
            "double a number",
            json!({"type": "object", "properties": {"n": {"type": "number"}}}),
            ToolKind::Function,
            |args: Value| async move {
                let n = args["n"].as_f64().ok_or_else(|| ToolError::InvalidArgs {
                    name: "double".into(),
                    message: "n must be a number".into(),
                })?;
                Ok(json!({"result": n * 2.0}))
            },
        );

        let tool = registry.resolve("double").unwrap();
        let out = tool.invoke(json!({"n": 4})).await.unwrap();
        assert_eq!(out["result"], json!(8.0));

        assert!(matches!(
            registry.resolve("nope"),
            Err(ToolError::Unknown { .. })
        ));
    }
}
