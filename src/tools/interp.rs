//! Polyglot interpreter pool.
//!
//! Inline code from validators and data cells runs in isolated subprocesses
//! with timeouts. Bindings travel as JSON in the `RVBBIT_BINDINGS`
//! environment variable; the wrapper injects them as top-level variables,
//! and the user code's `result` is printed on a marker line the engine
//! parses back out of stdout.

use serde_json::{json, Map, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::cascade::PolyglotLanguage;

use super::registry::{ToolError, ToolKind, ToolRegistry};

/// Marker prefixing the JSON result on stdout.
const RESULT_MARKER: &str = "__RVBBIT_RESULT__";

/// Default per-invocation timeout for interpreter subprocesses.
const DEFAULT_INTERP_TIMEOUT: Duration = Duration::from_secs(300);

/// Run inline code in the given language with JSON bindings.
pub async fn run_inline(
    language: PolyglotLanguage,
    code: &str,
    bindings: &Map<String, Value>,
    timeout: Option<Duration>,
) -> Result<Value, ToolError> {
    let tool_name = language.tool_name();
    let timeout = timeout.unwrap_or(DEFAULT_INTERP_TIMEOUT);
    match language {
        PolyglotLanguage::Python => {
            let program = format!(
                "import json, os, sys\n\
                 _bindings = json.loads(os.environ.get(\"RVBBIT_BINDINGS\", \"{{}}\"))\n\
                 globals().update(_bindings)\n\
                 result = None\n\
                 {code}\n\
                 print(\"{RESULT_MARKER}\" + json.dumps(result, default=str))\n"
            );
            run_subprocess(tool_name, "python3", &["-c", &program], bindings, timeout).await
        }
        PolyglotLanguage::Javascript => {
            let program = format!(
                "const _bindings = JSON.parse(process.env.RVBBIT_BINDINGS || \"{{}}\");\n\
                 for (const [k, v] of Object.entries(_bindings)) {{ globalThis[k] = v; }}\n\
                 let result = null;\n\
                 {code}\n\
                 console.log(\"{RESULT_MARKER}\" + JSON.stringify(result === undefined ? null : result));\n"
            );
            run_subprocess(tool_name, "node", &["-e", &program], bindings, timeout).await
        }
        PolyglotLanguage::Clojure => {
            let program = format!(
                "(require '[cheshire.core :as json])\n\
                 (def _bindings (json/parse-string (or (System/getenv \"RVBBIT_BINDINGS\") \"{{}}\") true))\n\
                 (doseq [[k v] _bindings] (intern *ns* (symbol (name k)) v))\n\
                 (def result (do {code}))\n\
                 (println (str \"{RESULT_MARKER}\" (json/generate-string result)))\n"
            );
            run_subprocess(tool_name, "bb", &["-e", &program], bindings, timeout).await
        }
        PolyglotLanguage::Bash => run_bash(code, bindings, timeout).await,
        PolyglotLanguage::Sql => Err(ToolError::InvalidArgs {
            name: tool_name.to_string(),
            message: "SQL runs through the sql_data tool, not the interpreter pool".to_string(),
        }),
    }
}

async fn run_subprocess(
    tool_name: &str,
    binary: &str,
    args: &[&str],
    bindings: &Map<String, Value>,
    timeout: Duration,
) -> Result<Value, ToolError> {
    let bindings_json =
        serde_json::to_string(&Value::Object(bindings.clone())).unwrap_or_else(|_| "{}".into());

    let mut command = Command::new(binary);
    command
        .args(args)
        .env("RVBBIT_BINDINGS", bindings_json)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|err| ToolError::Execution {
        name: tool_name.to_string(),
        message: format!("failed to spawn {binary}: {err}"),
    })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ToolError::Timeout {
            name: tool_name.to_string(),
            seconds: timeout.as_secs_f64(),
        })?
        .map_err(|err| ToolError::Execution {
            name: tool_name.to_string(),
            message: err.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ToolError::Execution {
            name: tool_name.to_string(),
            message: format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ),
        });
    }

    for line in stdout.lines().rev() {
        if let Some(payload) = line.strip_prefix(RESULT_MARKER) {
            return serde_json::from_str(payload).map_err(|err| ToolError::Execution {
                name: tool_name.to_string(),
                message: format!("result is not valid JSON: {err}"),
            });
        }
    }

    Err(ToolError::Execution {
        name: tool_name.to_string(),
        message: "interpreter produced no result marker".to_string(),
    })
}

async fn run_bash(
    code: &str,
    bindings: &Map<String, Value>,
    timeout: Duration,
) -> Result<Value, ToolError> {
    let mut command = Command::new("bash");
    command
        .arg("-c")
        .arg(code)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in bindings {
        command.env(format!("RVBBIT_{}", key.to_uppercase()), value_to_env(value));
    }

    let child = command.spawn().map_err(|err| ToolError::Execution {
        name: "bash_data".to_string(),
        message: format!("failed to spawn bash: {err}"),
    })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ToolError::Timeout {
            name: "bash_data".to_string(),
            seconds: timeout.as_secs_f64(),
        })?
        .map_err(|err| ToolError::Execution {
            name: "bash_data".to_string(),
            message: err.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let returncode = output.status.code().unwrap_or(-1);

    // A script that prints JSON gets it back as structure; anything else
    // returns the raw streams with routing derived from the exit code.
    if let Ok(parsed) = serde_json::from_str::<Value>(stdout.trim()) {
        return Ok(parsed);
    }
    Ok(json!({
        "stdout": stdout,
        "stderr": stderr,
        "returncode": returncode,
        "_route": if returncode == 0 { "success" } else { "error" },
    }))
}

/// Run a shell script file with inputs as `RVBBIT_<UPPER>` env vars.
pub async fn run_shell_script(
    path: &str,
    inputs: &Map<String, Value>,
    timeout: Option<Duration>,
) -> Result<Value, ToolError> {
    let timeout = timeout.unwrap_or(DEFAULT_INTERP_TIMEOUT);
    let mut command = Command::new("bash");
    command
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in inputs {
        command.env(format!("RVBBIT_{}", key.to_uppercase()), value_to_env(value));
    }

    let child = command.spawn().map_err(|err| ToolError::Execution {
        name: format!("shell:{path}"),
        message: err.to_string(),
    })?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ToolError::Timeout {
            name: format!("shell:{path}"),
            seconds: timeout.as_secs_f64(),
        })?
        .map_err(|err| ToolError::Execution {
            name: format!("shell:{path}"),
            message: err.to_string(),
        })?;

    let returncode = output.status.code().unwrap_or(-1);
    Ok(json!({
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
        "returncode": returncode,
        "_route": if returncode == 0 { "success" } else { "error" },
    }))
}

fn value_to_env(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Register the polyglot data tools on a registry.
///
/// `python_data`, `js_data`, `clojure_data`, and `bash_data` each take a
/// `code` input plus arbitrary bindings. `sql_data` is registered separately
/// where a database handle exists.
pub fn register_polyglot_tools(registry: &ToolRegistry) {
    for language in [
        PolyglotLanguage::Python,
        PolyglotLanguage::Javascript,
        PolyglotLanguage::Clojure,
        PolyglotLanguage::Bash,
    ] {
        let name = language.tool_name();
        registry.register_fn(
            name,
            &format!("Run inline {name} code with session bindings"),
            json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string", "description": "Code to run; assign to `result`."}
                },
                "required": ["code"]
            }),
            ToolKind::Function,
            move |args: Value| async move {
                let Value::Object(mut map) = args else {
                    return Err(ToolError::InvalidArgs {
                        name: language.tool_name().to_string(),
                        message: "arguments must be an object".to_string(),
                    });
                };
                let code = map
                    .remove(language.code_input())
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| ToolError::InvalidArgs {
                        name: language.tool_name().to_string(),
                        message: format!("missing '{}' input", language.code_input()),
                    })?;
                run_inline(language, &code, &map, None).await
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercised when a python3 binary is on PATH; the engine's own tests
    // use the in-process validator fixtures instead.
    #[tokio::test]
    #[ignore = "requires python3 on PATH"]
    async fn python_inline_round_trip() {
        let mut bindings = Map::new();
        bindings.insert("content".into(), json!("{\"answer\": 42}"));
        let result = run_inline(
            PolyglotLanguage::Python,
            "import json\nr = json.loads(content)\nresult = {'valid': r.get('answer') == 42, 'reason': 'checked'}",
            &bindings,
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();
        assert_eq!(result["valid"], json!(true));
    }

    #[tokio::test]
    async fn bash_inline_returns_streams() {
        let mut bindings = Map::new();
        bindings.insert("name".into(), json!("world"));
        let result = run_inline(
            PolyglotLanguage::Bash,
            "echo \"hello $RVBBIT_NAME\"",
            &bindings,
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();
        assert_eq!(result["returncode"], json!(0));
        assert!(result["stdout"].as_str().unwrap().contains("hello world"));
    }
}
