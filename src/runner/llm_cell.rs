//! The LLM cell turn loop.
//!
//! One turn: call the model with the current messages, execute any tool
//! calls (with ephemeral interception of oversized results), run turn
//! wards, check `loop_until`, and decide whether to go around again. The
//! loop ends on a clean response, a `<decision>` block, or an exhausted
//! budget.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use crate::cascade::{Cell, LlmCell};
use crate::context::{limit_loop_history, mask_stale_tool_results, BuiltContext};
use crate::cost::PendingCost;
use crate::event_bus::Event;
use crate::log::LogRow;
use crate::message::Message;
use crate::provider::{ChatRequest, ToolSchema};
use crate::rag::EphemeralRag;
use crate::template::RenderScope;
use crate::types::NodeType;
use crate::validators::{apply_wards, ValidatorDispatcher, WardVerdict};

use super::hooks::CascadeHooks;
use super::outcome::{CascadeFailure, FailureKind};
use super::services::Services;

/// Default turn budget when `rules.max_turns` is unset.
const DEFAULT_MAX_TURNS: u32 = 8;

/// A decision block extracted from model output.
#[derive(Clone, Debug, PartialEq)]
pub struct DecisionBlock {
    pub question: String,
    pub options: Vec<Value>,
    pub raw: Value,
}

/// How the turn loop ended.
pub enum TurnLoopResult {
    Done {
        content: String,
        output: Value,
        messages: Vec<Message>,
        turns: u32,
        duration_ms: u64,
    },
    /// A decision block suspended the cell; the payload carries everything
    /// resumption needs.
    Decision {
        decision: DecisionBlock,
        content: String,
        output: Value,
        messages: Vec<Message>,
    },
}

/// Inputs to one turn-loop execution.
pub struct TurnLoopParams<'a> {
    pub services: &'a Services,
    pub dispatcher: &'a ValidatorDispatcher,
    pub hooks: &'a Arc<dyn CascadeHooks>,
    pub cell: &'a Cell,
    pub llm: &'a LlmCell,
    pub instructions: String,
    pub context: BuiltContext,
    pub ephemeral: &'a mut EphemeralRag,
    pub scope: &'a RenderScope,
    pub original_input: &'a Value,
    pub session_id: &'a str,
    pub cascade_id: &'a str,
    pub species_hash: &'a str,
    pub genus_hash: &'a str,
    pub model: String,
    pub candidate_index: Option<u32>,
}

fn decision_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<decision>\s*(\{.*?\})\s*</decision>").unwrap())
}

fn tool_call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tool_call>\s*(\{.*?\})\s*</tool_call>").unwrap())
}

/// Extract a well-formed decision block, if any.
#[must_use]
pub fn extract_decision(content: &str) -> Option<DecisionBlock> {
    let captures = decision_regex().captures(content)?;
    let raw: Value = serde_json::from_str(&captures[1]).ok()?;
    let question = raw.get("question")?.as_str()?.to_string();
    let options = raw.get("options")?.as_array()?.clone();
    if options.is_empty() || options.iter().any(|o| o.get("id").is_none()) {
        return None;
    }
    Some(DecisionBlock {
        question,
        options,
        raw,
    })
}

/// Run the turn loop to completion or suspension.
pub async fn run_turn_loop(
    params: TurnLoopParams<'_>,
) -> Result<TurnLoopResult, CascadeFailure> {
    let TurnLoopParams {
        services,
        dispatcher,
        hooks,
        cell,
        llm,
        instructions,
        context,
        ephemeral,
        scope,
        original_input,
        session_id,
        cascade_id,
        species_hash,
        genus_hash,
        model,
        candidate_index,
    } = params;

    let started = Instant::now();
    let max_turns = cell
        .rules
        .as_ref()
        .and_then(|rules| rules.max_turns)
        .unwrap_or(DEFAULT_MAX_TURNS)
        .max(1);
    let intra = cell.intra_context.clone().unwrap_or_default();

    // Conversation for this cell: system instructions, injected context,
    // then the turn-by-turn exchange. Only the exchange past this prefix is
    // new conversation; the caller folds that part into the session history.
    let mut messages: Vec<Message> = Vec::new();
    messages.push(Message::system(instructions.clone()).from_cell(&cell.name));
    messages.extend(context.messages.clone());
    let prefix_len = messages.len();

    let mut ward_attempts: u32 = 0;
    let mut last_content = String::new();

    for turn in 0..max_turns {
        if hooks
            .on_turn_start(&cell.name, session_id, turn)
            .await
            .is_abort()
        {
            return Err(
                CascadeFailure::new(FailureKind::Aborted, "hook aborted at turn start")
                    .in_cell(&cell.name),
            );
        }

        // Compression between turns keeps the loop inside its own budget.
        messages = mask_stale_tool_results(messages, intra.window);
        if let Some(limit) = intra.loop_history_limit {
            if cell.rules.as_ref().map(|r| r.loop_until.is_some()).unwrap_or(false) {
                messages = limit_loop_history(messages, limit);
            }
        }

        // Declared traits plus the ephemeral search tools.
        let mut tools: Vec<ToolSchema> = services.registry.schemas_for(&llm.traits);
        tools.extend(ephemeral.tools().iter().map(|t| t.schema()));

        let request = ChatRequest {
            model: model.clone(),
            messages: messages.clone(),
            tools,
            temperature: None,
            max_tokens: None,
        };
        let full_request = request.to_log_value();

        let response = services.chat.complete(request).await.map_err(|err| {
            CascadeFailure::new(FailureKind::LlmExecution, err.to_string()).in_cell(&cell.name)
        })?;

        // The agent row goes out immediately; authoritative cost follows
        // through the tracker.
        let mut agent_row = LogRow::new(
            session_id,
            NodeType::Agent,
            Message::ASSISTANT,
            Value::String(response.content.clone()),
        )
        .in_cell(&cell.name, cascade_id)
        .with_species(species_hash)
        .with_context_hashes(context.context_hashes.clone());
        agent_row.genus_hash = Some(genus_hash.to_string());
        agent_row.model_requested = Some(model.clone());
        agent_row.model_actual = Some(response.model.clone());
        agent_row.tokens_in = response.usage.map(|u| u.tokens_in);
        agent_row.tokens_out = response.usage.map(|u| u.tokens_out);
        agent_row.candidate_index = candidate_index;
        agent_row.full_request_json = Some(full_request);
        let agent_trace = agent_row.trace_id.clone();
        services.log.append(agent_row).await.map_err(|err| {
            CascadeFailure::new(FailureKind::LlmExecution, err.to_string()).in_cell(&cell.name)
        })?;

        if let Some(request_id) = &response.request_id {
            let mut pending = PendingCost::new(session_id, request_id, &agent_trace)
                .in_cell(&cell.name, cascade_id);
            pending.candidate_index = candidate_index;
            services.cost_tracker.track(pending).await;
        }

        last_content = response.content.clone();
        let mut assistant = Message::assistant(&response.content).from_cell(&cell.name);
        if let Some(callouts) = &cell.callouts {
            if callouts.each_turn {
                if let Ok(label) = crate::template::render_text(&callouts.label, scope) {
                    assistant
                        .metadata
                        .insert(Message::META_CALLOUT.into(), Value::String(label));
                }
            }
        }
        messages.push(assistant);

        // Tool calls: native first, prompt-based as fallback.
        let mut invocations = response.tool_calls.clone();
        if invocations.is_empty() {
            for captures in tool_call_regex().captures_iter(&response.content) {
                if let Ok(parsed) = serde_json::from_str::<Value>(&captures[1]) {
                    if let (Some(name), Some(arguments)) = (
                        parsed.get("name").and_then(Value::as_str),
                        parsed.get("arguments"),
                    ) {
                        invocations.push(crate::provider::ToolInvocation {
                            id: crate::types::new_trace_id(),
                            name: name.to_string(),
                            arguments: arguments.clone(),
                        });
                    }
                }
            }
        }

        if !invocations.is_empty() {
            for invocation in invocations {
                if hooks
                    .on_tool_call(&invocation.name, &cell.name, session_id, &invocation.arguments)
                    .await
                    .is_abort()
                {
                    return Err(CascadeFailure::new(
                        FailureKind::Aborted,
                        "hook aborted at tool call",
                    )
                    .in_cell(&cell.name));
                }
                let call_row = LogRow::new(
                    session_id,
                    NodeType::ToolCall,
                    Message::ASSISTANT,
                    json!({"name": invocation.name.clone(), "arguments": invocation.arguments.clone()}),
                )
                .in_cell(&cell.name, cascade_id)
                .with_parent(&agent_trace);
                let call_trace = call_row.trace_id.clone();
                let _ = services.log.append(call_row).await;

                let result = run_tool(
                    services,
                    ephemeral,
                    &invocation.name,
                    invocation.arguments.clone(),
                )
                .await;

                let (result_value, tool_created) = match result {
                    Ok(value) => ephemeral.process_tool_result(&invocation.name, value).await,
                    Err(err) => (json!({"error": err}), None),
                };
                if let Some(tool_name) = tool_created {
                    tracing::debug!(
                        target: "rvbbit::runner",
                        cell = %cell.name,
                        tool = %tool_name,
                        "large tool result replaced by search tool"
                    );
                }

                if hooks
                    .on_tool_result(&invocation.name, &cell.name, session_id, &result_value)
                    .await
                    .is_abort()
                {
                    return Err(CascadeFailure::new(
                        FailureKind::Aborted,
                        "hook aborted at tool result",
                    )
                    .in_cell(&cell.name));
                }

                let result_row = LogRow::new(
                    session_id,
                    NodeType::ToolResult,
                    Message::TOOL,
                    result_value.clone(),
                )
                .in_cell(&cell.name, cascade_id)
                .with_parent(&call_trace);
                let result_hash = result_row.content_hash.clone();
                let _ = services.log.append(result_row).await;

                let text = match &result_value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                let tool_message = Message::tool(text)
                    .from_cell(&cell.name)
                    .with_meta(Message::META_CONTENT_HASH, Value::String(result_hash));
                messages.push(tool_message);
            }
            // Back to the model with the tool results in hand.
            continue;
        }

        // Turn wards run at the end of each turn.
        if let Some(wards) = &cell.wards {
            if !wards.turn.is_empty() {
                let verdict = apply_wards(
                    dispatcher,
                    &wards.turn,
                    &Value::String(response.content.clone()),
                    original_input,
                    scope,
                    ward_attempts,
                )
                .await
                .map_err(|err| {
                    CascadeFailure::new(FailureKind::Validation, err.to_string())
                        .in_cell(&cell.name)
                })?;
                log_ward_result(services, session_id, cascade_id, &cell.name, "turn", &verdict)
                    .await;
                match verdict {
                    WardVerdict::Pass { .. } => {}
                    WardVerdict::Retry {
                        reason,
                        retry_instructions,
                    } => {
                        ward_attempts += 1;
                        let note = retry_instructions.unwrap_or(reason);
                        messages.push(Message::user(note).from_cell(&cell.name));
                        continue;
                    }
                    WardVerdict::Block { reason } => {
                        return Err(CascadeFailure::new(FailureKind::Validation, reason)
                            .in_cell(&cell.name)
                            .with_partial(Value::String(response.content)));
                    }
                }
            }
        }

        // loop_until gate.
        if let Some(loop_until) = cell.rules.as_ref().and_then(|r| r.loop_until.as_ref()) {
            let outcome = dispatcher
                .run(
                    loop_until,
                    &Value::String(response.content.clone()),
                    original_input,
                    scope,
                )
                .await
                .map_err(|err| {
                    CascadeFailure::new(FailureKind::Validation, err.to_string())
                        .in_cell(&cell.name)
                })?;
            if !outcome.valid {
                let silent = cell
                    .rules
                    .as_ref()
                    .map(|r| r.loop_until_silent)
                    .unwrap_or(false);
                if turn + 1 >= max_turns {
                    return Err(CascadeFailure::new(
                        FailureKind::Validation,
                        format!("loop_until_exhausted: {}", outcome.reason),
                    )
                    .in_cell(&cell.name)
                    .with_partial(Value::String(response.content)));
                }
                if !silent {
                    messages.push(Message::user(outcome.reason).from_cell(&cell.name));
                }
                continue;
            }
        }

        // Decision points: a well-formed block suspends the cell.
        let decisions_enabled = cell
            .decision_points
            .as_ref()
            .map(|d| d.enabled)
            .unwrap_or(false);
        if decisions_enabled {
            if let Some(decision) = extract_decision(&response.content) {
                let output = parse_output(&response.content);
                let new_messages = messages.split_off(prefix_len.min(messages.len()));
                return Ok(TurnLoopResult::Decision {
                    decision,
                    content: response.content,
                    output,
                    messages: new_messages,
                });
            }
        }

        // Clean completion.
        if let Some(callouts) = &cell.callouts {
            if let Ok(label) = crate::template::render_text(&callouts.label, scope) {
                if let Some(last) = messages.last_mut() {
                    last.metadata
                        .insert(Message::META_CALLOUT.into(), Value::String(label));
                }
            }
        }
        let output = parse_output(&response.content);
        let new_messages = messages.split_off(prefix_len.min(messages.len()));
        return Ok(TurnLoopResult::Done {
            content: response.content,
            output,
            messages: new_messages,
            turns: turn + 1,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    Err(CascadeFailure::new(
        FailureKind::Validation,
        format!("turn budget exhausted after {max_turns} turns"),
    )
    .in_cell(&cell.name)
    .with_partial(Value::String(last_content)))
}

/// Execute a named tool: ephemeral search tools first, then the registry.
async fn run_tool(
    services: &Services,
    ephemeral: &EphemeralRag,
    name: &str,
    arguments: Value,
) -> Result<Value, String> {
    if ephemeral.tool(name).is_some() {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let limit = arguments
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(5) as usize;
        let smart = arguments
            .get("smart")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let reranker = (&services.chat, services.config.utility_model.as_str());
        return ephemeral
            .search(name, query, limit, smart, Some((reranker.0, reranker.1)))
            .await
            .map(Value::String)
            .map_err(|e| e.to_string());
    }

    let tool = services
        .registry
        .resolve(name)
        .map_err(|e| e.to_string())?;
    let args = match arguments {
        Value::Object(map) => Value::Object(map),
        Value::Null => Value::Object(Map::new()),
        other => json!({"input": other}),
    };
    tool.invoke(args).await.map_err(|e| e.to_string())
}

async fn log_ward_result(
    services: &Services,
    session_id: &str,
    cascade_id: &str,
    cell_name: &str,
    phase: &str,
    verdict: &WardVerdict,
) {
    let content = match verdict {
        WardVerdict::Pass { advisories } if advisories.is_empty() => {
            json!({"phase": phase, "passed": true})
        }
        WardVerdict::Pass { advisories } => json!({
            "phase": phase,
            "passed": true,
            "advisories": advisories.iter().map(|a| a.reason.clone()).collect::<Vec<_>>(),
        }),
        WardVerdict::Retry { reason, .. } => {
            json!({"phase": phase, "passed": false, "retry": true, "reason": reason})
        }
        WardVerdict::Block { reason } => {
            json!({"phase": phase, "passed": false, "reason": reason})
        }
    };
    let row = LogRow::new(session_id, NodeType::WardResult, "system", content)
        .in_cell(cell_name, cascade_id);
    let _ = services.log.append(row).await;
    services.bus.publish(Event::now(
        "ward_result",
        session_id,
        json!({"cell": cell_name, "phase": phase}),
    ));
}

/// Structured output when the content is a JSON object, a wrapper dict
/// otherwise.
#[must_use]
pub fn parse_output(content: &str) -> Value {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return value;
        }
    }
    json!({"content": content})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_blocks_require_question_and_options() {
        let content = r#"Before I continue:
<decision>{"question": "Which path?", "options": [{"id": "a", "label": "A"}, {"id": "b", "label": "B"}]}</decision>"#;
        let decision = extract_decision(content).unwrap();
        assert_eq!(decision.question, "Which path?");
        assert_eq!(decision.options.len(), 2);

        assert!(extract_decision("<decision>{\"question\": \"x\"}</decision>").is_none());
        assert!(extract_decision("no block here").is_none());
        assert!(extract_decision(
            "<decision>{\"question\": \"x\", \"options\": [{\"label\": \"missing id\"}]}</decision>"
        )
        .is_none());
    }

    #[test]
    fn output_parses_json_objects_only() {
        assert_eq!(parse_output(r#"{"answer": 42}"#), json!({"answer": 42}));
        assert_eq!(parse_output("[1,2,3]"), json!({"content": "[1,2,3]"}));
        assert_eq!(parse_output("plain"), json!({"content": "plain"}));
    }
}
