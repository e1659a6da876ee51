//! LLM-assisted repair for failing deterministic tools.
//!
//! When a cell opts into `auto_fix`, a failing code-bearing tool gets its
//! code handed to a cheap model along with the error; the repaired code is
//! re-invoked, up to `max_attempts` times.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::cascade::AutoFixConfig;
use crate::message::Message;
use crate::provider::{ChatClient, ChatRequest};

use super::registry::ToolError;

/// Input keys that carry repairable code, checked in order.
const CODE_KEYS: &[&str] = &["code", "query"];

/// Which input key holds this tool's code, if any.
#[must_use]
pub fn code_key(inputs: &Map<String, Value>) -> Option<&'static str> {
    CODE_KEYS
        .iter()
        .copied()
        .find(|key| inputs.get(*key).map(Value::is_string).unwrap_or(false))
}

/// Ask the repair model for corrected code.
///
/// Returns `None` when the tool carries no code or the model's answer is
/// unusable; callers fall through to their normal error path.
pub async fn propose_fix(
    client: &Arc<dyn ChatClient>,
    model: &str,
    tool_name: &str,
    inputs: &Map<String, Value>,
    error: &ToolError,
) -> Option<Map<String, Value>> {
    let key = code_key(inputs)?;
    let original_code = inputs.get(key)?.as_str()?;

    let mut other_inputs = inputs.clone();
    other_inputs.remove(key);
    let prompt = format!(
        "A tool execution failed. Repair the code so it runs.\n\n\
         tool_type: {tool_name}\n\
         error: {error}\n\
         inputs: {}\n\n\
         original_code:\n```\n{original_code}\n```\n\n\
         Reply with ONLY the corrected code, no fences, no commentary.",
        Value::Object(other_inputs),
    );

    let request = ChatRequest::new(
        model,
        vec![
            Message::system("You repair failing code. Output only the corrected code."),
            Message::user(prompt),
        ],
    );
    let response = match client.complete(request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(target: "rvbbit::tools", error = %err, "auto-fix model call failed");
            return None;
        }
    };

    let fixed = strip_fences(&response.content);
    if fixed.trim().is_empty() || fixed.trim() == original_code.trim() {
        return None;
    }

    let mut repaired = inputs.clone();
    repaired.insert(key.to_string(), Value::String(fixed));
    Some(repaired)
}

/// Effective attempt budget for an auto-fix config.
#[must_use]
pub fn attempt_budget(config: &AutoFixConfig) -> u32 {
    config.max_attempts.max(1)
}

fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("```") {
        let inner = inner
            .split_once('\n')
            .map(|(_, rest)| rest)
            .unwrap_or(inner);
        if let Some(body) = inner.strip_suffix("```") {
            return body.trim().to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn code_key_prefers_code_then_query() {
        let mut inputs = Map::new();
        inputs.insert("query".into(), json!("SELECT 1"));
        assert_eq!(code_key(&inputs), Some("query"));
        inputs.insert("code".into(), json!("print(1)"));
        assert_eq!(code_key(&inputs), Some("code"));
        assert_eq!(code_key(&Map::new()), None);
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```python\nx = 1\n```"), "x = 1");
        assert_eq!(strip_fences("plain"), "plain");
    }
}
