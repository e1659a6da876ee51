//! Deterministic cell execution: direct tool runs without LLM mediation.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use crate::cascade::{AutoFixConfig, Cell, DeterministicCell, OnErrorSpec};
use crate::template::{render_inputs, render_text, RenderScope};
use crate::tools::{
    autofix, execute_with_retry, interp, parse_timeout, parse_tool_target, ToolError, ToolTarget,
};

use super::outcome::{CascadeFailure, FailureKind};
use super::services::Services;

/// Tools that receive the session bindings (`_cell_name`, `_session_id`,
/// `_outputs`, `_state`, `_input`).
const DATA_TOOLS: &[&str] = &[
    "sql_data",
    "python_data",
    "js_data",
    "clojure_data",
    "bash_data",
];

/// Outcome of a deterministic cell's main work.
pub struct DeterministicResult {
    pub output: Value,
    pub duration_ms: u64,
}

/// Execute a deterministic cell's tool with rendering, retry, timeout, and
/// auto-fix.
#[allow(clippy::too_many_arguments)]
pub async fn execute_deterministic(
    services: &Services,
    cell: &Cell,
    det: &DeterministicCell,
    scope: &RenderScope,
    session_id: &str,
    input: &Value,
    outputs: &Value,
    state: &Value,
    cascade_dir: Option<&Path>,
) -> Result<DeterministicResult, CascadeFailure> {
    // Render tool inputs to native values.
    let mut rendered =
        render_inputs(&det.tool_inputs, scope).map_err(|err| {
            CascadeFailure::new(FailureKind::Resolution, err.to_string()).in_cell(&cell.name)
        })?;

    // Data tools see the session alongside their declared inputs.
    if DATA_TOOLS.contains(&det.tool.as_str()) {
        rendered.insert("_cell_name".into(), Value::String(cell.name.clone()));
        rendered.insert("_session_id".into(), Value::String(session_id.to_string()));
        rendered.insert("_outputs".into(), outputs.clone());
        rendered.insert("_state".into(), state.clone());
        rendered.insert("_input".into(), input.clone());
    }

    let timeout = match &cell.timeout {
        Some(spec) => Some(parse_timeout(spec).map_err(|err| {
            CascadeFailure::new(FailureKind::Configuration, err.to_string()).in_cell(&cell.name)
        })?),
        None => None,
    };

    let started = Instant::now();
    let first = execute_with_retry(&det.tool, cell.retry.as_ref(), timeout, || {
        invoke_target(services, &det.tool, rendered.clone(), scope, cascade_dir)
    })
    .await;

    let output = match first {
        Ok(output) => output,
        Err(err) => {
            // Auto-fix path: ask a cheap model to repair the code, then
            // retry the same target with the repaired inputs.
            if let Some(fix_config) = autofix_config(cell.on_error.as_ref()) {
                match run_autofix(services, cell, det, &rendered, &err, &fix_config, scope, cascade_dir)
                    .await
                {
                    Some(output) => output,
                    None => return Err(failure_for(&cell.name, err, None)),
                }
            } else {
                return Err(failure_for(&cell.name, err, None));
            }
        }
    };

    Ok(DeterministicResult {
        output,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Route resolution shared by deterministic and LLM paths.
///
/// Priority: `result._route`, then `result.status`, then `"success"`,
/// matched against the routing map (`default` as catch-all); without a
/// routing map a single handoff wins; otherwise no successor.
#[must_use]
pub fn determine_routing(
    result: &Value,
    routing: Option<&BTreeMap<String, String>>,
    handoffs: &[String],
) -> Option<String> {
    let route_key = result
        .get("_route")
        .and_then(Value::as_str)
        .or_else(|| result.get("status").and_then(Value::as_str))
        .unwrap_or("success");

    if let Some(routing) = routing {
        if let Some(target) = routing.get(route_key) {
            return Some(target.clone());
        }
        if let Some(target) = routing.get("default") {
            return Some(target.clone());
        }
    }
    if handoffs.len() == 1 {
        return Some(handoffs[0].clone());
    }
    None
}

async fn invoke_target(
    services: &Services,
    tool_spec: &str,
    args: Map<String, Value>,
    scope: &RenderScope,
    cascade_dir: Option<&Path>,
) -> Result<Value, ToolError> {
    // An exact registration wins over spec parsing, which lets hosts
    // override `python:`/`shell:` targets with in-process implementations.
    if let Some(tool) = services.registry.get(tool_spec) {
        return tool.invoke(Value::Object(args)).await;
    }

    match parse_tool_target(tool_spec)? {
        ToolTarget::Registered(name) => {
            let tool = services.registry.resolve(&name)?;
            tool.invoke(Value::Object(args)).await
        }
        ToolTarget::Python { module, function } => {
            // Dynamic import runs through the interpreter pool.
            let code = format!(
                "from {module} import {function}\nresult = {function}(**_args)"
            );
            let mut bindings = Map::new();
            bindings.insert("_args".into(), Value::Object(args));
            interp::run_inline(
                crate::cascade::PolyglotLanguage::Python,
                &code,
                &bindings,
                None,
            )
            .await
        }
        ToolTarget::Sql { path } => {
            let resolved = resolve_path(&path, cascade_dir);
            let template =
                std::fs::read_to_string(&resolved).map_err(|err| ToolError::Execution {
                    name: tool_spec.to_string(),
                    message: format!("cannot read {}: {err}", resolved.display()),
                })?;
            let mut sql_scope = scope.clone();
            sql_scope.bind("inputs", Value::Object(args));
            let query = render_text(&template, &sql_scope).map_err(|err| {
                ToolError::InvalidArgs {
                    name: tool_spec.to_string(),
                    message: err.to_string(),
                }
            })?;
            let sql_tool = services.registry.resolve("sql_data")?;
            let mut sql_args = Map::new();
            sql_args.insert("query".into(), Value::String(query));
            sql_tool.invoke(Value::Object(sql_args)).await
        }
        ToolTarget::Shell { path } => {
            let resolved = resolve_path(&path, cascade_dir);
            interp::run_shell_script(&resolved.to_string_lossy(), &args, None).await
        }
    }
}

fn resolve_path(path: &str, cascade_dir: Option<&Path>) -> std::path::PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    match cascade_dir {
        Some(dir) => dir.join(candidate),
        None => candidate.to_path_buf(),
    }
}

fn autofix_config(on_error: Option<&OnErrorSpec>) -> Option<AutoFixConfig> {
    match on_error {
        Some(OnErrorSpec::Route(route)) if route == "auto_fix" => Some(AutoFixConfig::default()),
        Some(OnErrorSpec::Config(config)) => config.auto_fix.clone(),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_autofix(
    services: &Services,
    cell: &Cell,
    det: &DeterministicCell,
    rendered: &Map<String, Value>,
    error: &ToolError,
    fix_config: &AutoFixConfig,
    scope: &RenderScope,
    cascade_dir: Option<&Path>,
) -> Option<Value> {
    let model = fix_config
        .model
        .clone()
        .unwrap_or_else(|| services.config.utility_model.clone());
    let mut inputs = rendered.clone();
    let mut last_error = error.to_string();

    for attempt in 0..autofix::attempt_budget(fix_config) {
        let repaired = autofix::propose_fix(
            &services.chat,
            &model,
            &det.tool,
            &inputs,
            &ToolError::Execution {
                name: det.tool.clone(),
                message: last_error.clone(),
            },
        )
        .await?;

        tracing::info!(
            target: "rvbbit::runner",
            cell = %cell.name,
            attempt = attempt + 1,
            "auto-fix retrying tool with repaired code"
        );
        match invoke_target(services, &det.tool, repaired.clone(), scope, cascade_dir).await {
            Ok(output) => return Some(output),
            Err(err) => {
                last_error = err.to_string();
                inputs = repaired;
            }
        }
    }
    None
}

fn failure_for(cell_name: &str, err: ToolError, partial: Option<Value>) -> CascadeFailure {
    let kind = match &err {
        ToolError::Timeout { .. } => FailureKind::Timeout,
        ToolError::Unknown { .. } => FailureKind::Resolution,
        _ => FailureKind::ToolExecution,
    };
    let mut failure = CascadeFailure::new(kind, err.to_string()).in_cell(cell_name);
    if let Some(partial) = partial {
        failure = failure.with_partial(partial);
    }
    failure
}
