//! Validator dispatch: resolving a spec to an executable and normalizing
//! its verdict.
//!
//! Every validator, however it is expressed, settles to the same contract:
//! it receives `{content, original_input}` plus any tool-specific bindings
//! and must produce `{valid: bool, reason: string}`. Any other shape is a
//! `validator_invalid` failure; execution errors propagate as themselves.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cascade::{ValidatorSpec, WardMode, WardSpec};
use crate::template::{render_inputs, RenderScope};
use crate::tools::{interp, ToolError, ToolRegistry};

/// The normalized validator verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorOutcome {
    pub valid: bool,
    #[serde(default)]
    pub reason: String,
}

impl ValidatorOutcome {
    #[must_use]
    pub fn pass() -> Self {
        Self {
            valid: true,
            reason: String::new(),
        }
    }

    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// Errors from validator resolution and execution.
#[derive(Debug, Error, Diagnostic)]
pub enum ValidatorError {
    #[error("validator '{validator}' not found")]
    #[diagnostic(
        code(rvbbit::validators::missing),
        help("Name a registered validator tool, a cascade-level validator, or use an inline block.")
    )]
    Missing { validator: String },

    #[error("validator '{validator}' returned an invalid shape: {detail}")]
    #[diagnostic(
        code(rvbbit::validators::validator_invalid),
        help("Validators must return {{\"valid\": bool, \"reason\": string}}.")
    )]
    Invalid { validator: String, detail: String },

    #[error("validator '{validator}' is ambiguous: {detail}")]
    #[diagnostic(code(rvbbit::validators::ambiguous))]
    Ambiguous { validator: String, detail: String },

    #[error(transparent)]
    #[diagnostic(code(rvbbit::validators::tool))]
    Tool(#[from] ToolError),

    #[error("failed to render validator inputs: {0}")]
    #[diagnostic(code(rvbbit::validators::template))]
    Template(#[from] crate::template::TemplateError),
}

/// Resolves validator specs and runs them against content.
#[derive(Clone)]
pub struct ValidatorDispatcher {
    registry: ToolRegistry,
    /// Cascade-level named validators, consulted before the tool registry.
    named: std::sync::Arc<std::collections::BTreeMap<String, ValidatorSpec>>,
}

impl ValidatorDispatcher {
    #[must_use]
    pub fn new(
        registry: ToolRegistry,
        named: std::collections::BTreeMap<String, ValidatorSpec>,
    ) -> Self {
        Self {
            registry,
            named: std::sync::Arc::new(named),
        }
    }

    /// Run a validator spec against `content`.
    ///
    /// `original_input` is the cascade input the content was produced from;
    /// both are always bound for the validator to inspect.
    pub async fn run(
        &self,
        spec: &ValidatorSpec,
        content: &Value,
        original_input: &Value,
        scope: &RenderScope,
    ) -> Result<ValidatorOutcome, ValidatorError> {
        let result = self
            .execute(spec, content, original_input, scope, 0)
            .await?;
        normalize(spec, result)
    }

    async fn execute(
        &self,
        spec: &ValidatorSpec,
        content: &Value,
        original_input: &Value,
        scope: &RenderScope,
        depth: u8,
    ) -> Result<Value, ValidatorError> {
        if depth > 4 {
            return Err(ValidatorError::Ambiguous {
                validator: spec.describe(),
                detail: "named validator chain too deep".to_string(),
            });
        }

        match spec {
            ValidatorSpec::Named(name) => {
                // Cascade-level names first, then registered tools. A named
                // validator cascade is registered as a CascadeRef tool by
                // the runner and lands in the registry branch.
                if let Some(inner) = self.named.get(name) {
                    return Box::pin(self.execute(inner, content, original_input, scope, depth + 1))
                        .await;
                }
                let tool = self
                    .registry
                    .get(name)
                    .ok_or_else(|| ValidatorError::Missing {
                        validator: name.clone(),
                    })?;
                let args = base_bindings(content, original_input);
                Ok(tool.invoke(Value::Object(args)).await?)
            }
            ValidatorSpec::Call(call) => {
                let tool = self
                    .registry
                    .get(&call.tool)
                    .ok_or_else(|| ValidatorError::Missing {
                        validator: call.tool.clone(),
                    })?;
                let mut args = base_bindings(content, original_input);
                let rendered = render_inputs(&call.inputs, scope)?;
                for (key, value) in rendered {
                    args.insert(key, value);
                }
                Ok(tool.invoke(Value::Object(args)).await?)
            }
            ValidatorSpec::Inline(block) => {
                let (language, code) =
                    block.language().map_err(|err| ValidatorError::Ambiguous {
                        validator: spec.describe(),
                        detail: err.to_string(),
                    })?;
                // The fixed mapping: the language's data tool with the code
                // under its expected input key, content bound alongside.
                if self.registry.contains(language.tool_name()) {
                    let tool = self.registry.resolve(language.tool_name())?;
                    let mut args = base_bindings(content, original_input);
                    args.insert(
                        language.code_input().to_string(),
                        Value::String(code.to_string()),
                    );
                    Ok(tool.invoke(Value::Object(args)).await?)
                } else {
                    let bindings = base_bindings(content, original_input);
                    Ok(interp::run_inline(language, code, &bindings, None).await?)
                }
            }
        }
    }
}

fn base_bindings(content: &Value, original_input: &Value) -> Map<String, Value> {
    let mut args = Map::new();
    // String content stays a string; structured content travels serialized
    // so polyglot code can json-parse it the same way either way.
    let content_binding = match content {
        Value::String(text) => Value::String(text.clone()),
        other => Value::String(other.to_string()),
    };
    args.insert("content".to_string(), content_binding);
    args.insert("original_input".to_string(), original_input.clone());
    args
}

fn normalize(spec: &ValidatorSpec, result: Value) -> Result<ValidatorOutcome, ValidatorError> {
    let object = result.as_object().ok_or_else(|| ValidatorError::Invalid {
        validator: spec.describe(),
        detail: format!("expected an object, got {result}"),
    })?;
    let valid = object
        .get("valid")
        .and_then(Value::as_bool)
        .ok_or_else(|| ValidatorError::Invalid {
            validator: spec.describe(),
            detail: "missing boolean 'valid'".to_string(),
        })?;
    let reason = object
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(ValidatorOutcome { valid, reason })
}

/// Verdict of a ward group applied to content.
#[derive(Clone, Debug, PartialEq)]
pub enum WardVerdict {
    /// Every ward passed (advisory failures are carried for logging).
    Pass { advisories: Vec<ValidatorOutcome> },
    /// A retry-mode ward failed with budget remaining.
    Retry {
        reason: String,
        retry_instructions: Option<String>,
    },
    /// A blocking ward failed (or a retry ward exhausted its attempts).
    Block { reason: String },
}

/// Apply a ward list to content, observing each ward's mode.
///
/// `attempt` is how many times the cell's main work has already re-entered
/// for these wards; retry wards turn blocking once it reaches their
/// `max_attempts`.
pub async fn apply_wards(
    dispatcher: &ValidatorDispatcher,
    wards: &[WardSpec],
    content: &Value,
    original_input: &Value,
    scope: &RenderScope,
    attempt: u32,
) -> Result<WardVerdict, ValidatorError> {
    let mut advisories = Vec::new();

    for ward in wards {
        let outcome = dispatcher
            .run(&ward.validator, content, original_input, scope)
            .await?;
        if outcome.valid {
            continue;
        }
        match ward.mode {
            WardMode::Advisory => {
                tracing::info!(
                    target: "rvbbit::wards",
                    validator = %ward.validator.describe(),
                    reason = %outcome.reason,
                    "advisory ward failed"
                );
                advisories.push(outcome);
            }
            WardMode::Blocking => {
                return Ok(WardVerdict::Block {
                    reason: outcome.reason,
                });
            }
            WardMode::Retry => {
                if attempt + 1 < ward.max_attempts {
                    return Ok(WardVerdict::Retry {
                        reason: outcome.reason,
                        retry_instructions: ward.retry_instructions.clone(),
                    });
                }
                // Budget exhausted: the ward becomes blocking.
                return Ok(WardVerdict::Block {
                    reason: outcome.reason,
                });
            }
        }
    }

    Ok(WardVerdict::Pass { advisories })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::{PolyglotBlock, ValidatorCall};
    use crate::tools::ToolKind;
    use serde_json::json;

    fn dispatcher_with(registry: ToolRegistry) -> ValidatorDispatcher {
        ValidatorDispatcher::new(registry, std::collections::BTreeMap::new())
    }

    fn length_validator(registry: &ToolRegistry) {
        registry.register_fn(
            "max_len",
            "content length gate",
            json!({"type": "object"}),
            ToolKind::Validator,
            |args: Value| async move {
                let content = args["content"].as_str().unwrap_or_default();
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(10);
                Ok(json!({
                    "valid": (content.len() as u64) <= limit,
                    "reason": format!("length {} vs limit {limit}", content.len()),
                }))
            },
        );
    }

    #[tokio::test]
    async fn named_validator_runs_and_normalizes() {
        let registry = ToolRegistry::new();
        length_validator(&registry);
        let dispatcher = dispatcher_with(registry);
        let outcome = dispatcher
            .run(
                &ValidatorSpec::Named("max_len".into()),
                &json!("short"),
                &json!({}),
                &RenderScope::new(),
            )
            .await
            .unwrap();
        assert!(outcome.valid);
    }

    #[tokio::test]
    async fn call_spec_renders_inputs() {
        let registry = ToolRegistry::new();
        length_validator(&registry);
        let dispatcher = dispatcher_with(registry);
        let mut inputs = Map::new();
        inputs.insert("limit".into(), json!("{{ input.limit }}"));
        let scope = RenderScope::new().with("input", json!({"limit": 3}));
        let outcome = dispatcher
            .run(
                &ValidatorSpec::Call(ValidatorCall {
                    tool: "max_len".into(),
                    inputs,
                }),
                &json!("too long"),
                &json!({}),
                &scope,
            )
            .await
            .unwrap();
        assert!(!outcome.valid);
        assert!(outcome.reason.contains("limit 3"));
    }

    #[tokio::test]
    async fn invalid_shape_is_validator_invalid() {
        let registry = ToolRegistry::new();
        registry.register_fn(
            "broken",
            "returns the wrong shape",
            json!({"type": "object"}),
            ToolKind::Validator,
            |_| async move { Ok(json!("nope")) },
        );
        let dispatcher = dispatcher_with(registry);
        let err = dispatcher
            .run(
                &ValidatorSpec::Named("broken".into()),
                &json!("x"),
                &json!({}),
                &RenderScope::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ValidatorError::Invalid { .. }));
    }

    #[tokio::test]
    async fn inline_block_routes_to_registered_interpreter() {
        let registry = ToolRegistry::new();
        // Stand-in python_data that checks the code arrived under `code`.
        registry.register_fn(
            "python_data",
            "test interpreter",
            json!({"type": "object"}),
            ToolKind::Function,
            |args: Value| async move {
                assert!(args["code"].as_str().unwrap().contains("result"));
                assert!(args["content"].is_string());
                Ok(json!({"valid": true, "reason": "ran"}))
            },
        );
        let dispatcher = dispatcher_with(registry);
        let outcome = dispatcher
            .run(
                &ValidatorSpec::Inline(PolyglotBlock::python("result = {'valid': True}")),
                &json!({"answer": 42}),
                &json!({}),
                &RenderScope::new(),
            )
            .await
            .unwrap();
        assert!(outcome.valid);
        assert_eq!(outcome.reason, "ran");
    }

    #[tokio::test]
    async fn retry_ward_becomes_blocking_after_budget() {
        let registry = ToolRegistry::new();
        registry.register_fn(
            "always_fail",
            "fails",
            json!({"type": "object"}),
            ToolKind::Validator,
            |_| async move { Ok(json!({"valid": false, "reason": "nope"})) },
        );
        let dispatcher = dispatcher_with(registry);
        let ward = WardSpec {
            validator: ValidatorSpec::Named("always_fail".into()),
            mode: WardMode::Retry,
            max_attempts: 2,
            retry_instructions: Some("try harder".into()),
        };

        let verdict = apply_wards(
            &dispatcher,
            std::slice::from_ref(&ward),
            &json!("x"),
            &json!({}),
            &RenderScope::new(),
            0,
        )
        .await
        .unwrap();
        assert!(matches!(verdict, WardVerdict::Retry { .. }));

        let verdict = apply_wards(
            &dispatcher,
            std::slice::from_ref(&ward),
            &json!("x"),
            &json!({}),
            &RenderScope::new(),
            1,
        )
        .await
        .unwrap();
        assert!(matches!(verdict, WardVerdict::Block { .. }));
    }

    #[tokio::test]
    async fn advisory_failures_never_block() {
        let registry = ToolRegistry::new();
        registry.register_fn(
            "grumble",
            "always unhappy",
            json!({"type": "object"}),
            ToolKind::Validator,
            |_| async move { Ok(json!({"valid": false, "reason": "meh"})) },
        );
        let dispatcher = dispatcher_with(registry);
        let ward = WardSpec {
            validator: ValidatorSpec::Named("grumble".into()),
            mode: WardMode::Advisory,
            max_attempts: 3,
            retry_instructions: None,
        };
        let verdict = apply_wards(
            &dispatcher,
            &[ward],
            &json!("x"),
            &json!({}),
            &RenderScope::new(),
            0,
        )
        .await
        .unwrap();
        match verdict {
            WardVerdict::Pass { advisories } => assert_eq!(advisories.len(), 1),
            other => panic!("expected pass with advisories, got {other:?}"),
        }
    }
}
