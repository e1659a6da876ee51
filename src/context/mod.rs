//! Context management: which prior messages an LLM cell sees.
//!
//! Two layers operate here:
//!
//! - **Inter-cell selection** builds the context message list from the echo:
//!   explicit `from` sources, or auto mode with anchors plus a scored
//!   selection strategy (heuristic, semantic, LLM, hybrid).
//! - **Budget and compression** keep the list inside the cascade's token
//!   budget and mask stale tool results between turns.
//!
//! Token counts are estimated at four characters per token; the budget
//! strategies only need relative sizes to hold their invariants.

use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::cascade::{
    AnchorSlice, BudgetStrategy, ContextConfig, ContextSource, ContextSourceSpec, IncludeKind,
    SelectionConfig, SelectionStrategy, TokenBudgetConfig,
};
use crate::echo::Echo;
use crate::hashes;
use crate::message::Message;
use crate::provider::{ChatClient, ChatRequest, EmbeddingClient};
use crate::template::{render_value, RenderScope};

/// Errors from context building and budgeting.
#[derive(Debug, Error, Diagnostic)]
pub enum ContextError {
    #[error("context exceeds token budget: {actual} tokens against max_total {max}")]
    #[diagnostic(
        code(rvbbit::context::budget),
        help("The cascade's token_budget strategy is `fail`; trim context sources or switch strategy.")
    )]
    BudgetExceeded { actual: usize, max: usize },

    #[error(transparent)]
    #[diagnostic(code(rvbbit::context::template))]
    Template(#[from] crate::template::TemplateError),
}

/// Estimated tokens for a message (chars / 4, minimum 1).
#[must_use]
pub fn estimate_tokens(message: &Message) -> usize {
    (message.content.chars().count() / 4).max(1)
}

/// Estimated tokens for a whole list.
#[must_use]
pub fn estimate_total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_tokens).sum()
}

/// The assembled context plus the hashes analytics attributes cost to.
#[derive(Clone, Debug, Default)]
pub struct BuiltContext {
    pub messages: Vec<Message>,
    /// Content hashes of injected prior-session material, in order.
    pub context_hashes: Vec<String>,
}

/// Builds context message lists for LLM cells.
pub struct ContextManager {
    chat: Arc<dyn ChatClient>,
    embedder: Arc<dyn EmbeddingClient>,
    utility_model: String,
    embed_model: String,
}

impl ContextManager {
    #[must_use]
    pub fn new(
        chat: Arc<dyn ChatClient>,
        embedder: Arc<dyn EmbeddingClient>,
        utility_model: &str,
        embed_model: &str,
    ) -> Self {
        Self {
            chat,
            embedder,
            utility_model: utility_model.to_string(),
            embed_model: embed_model.to_string(),
        }
    }

    /// Build the inter-cell context for a cell about to run.
    ///
    /// `query_text` is the cell's rendered instructions, used as the scoring
    /// query in auto mode.
    pub async fn build(
        &self,
        config: Option<&ContextConfig>,
        echo: &Echo,
        input: &Value,
        query_text: &str,
        scope: &RenderScope,
    ) -> Result<BuiltContext, ContextError> {
        let Some(config) = config else {
            return Ok(BuiltContext::default());
        };

        let mut built = BuiltContext::default();
        if config.include_input && !input.is_null() {
            let mut message = Message::user(format!("Input: {}", compact(input)));
            let hash = hashes::content_hash(input);
            message
                .metadata
                .insert(Message::META_CONTENT_HASH.into(), Value::String(hash.clone()));
            built.context_hashes.push(hash);
            built.messages.push(message);
        }

        if let Some(sources) = &config.from {
            self.build_explicit(sources, echo, scope, &mut built)?;
        } else {
            self.build_auto(config, echo, query_text, &mut built).await?;
        }

        Ok(built)
    }

    fn build_explicit(
        &self,
        sources: &[ContextSource],
        echo: &Echo,
        scope: &RenderScope,
        built: &mut BuiltContext,
    ) -> Result<(), ContextError> {
        let completed: Vec<String> = echo
            .completed_cells()
            .iter()
            .map(|s| (*s).to_string())
            .collect();

        for source in sources {
            let specs = expand_source(source, &completed);
            for spec in specs {
                if let Some(condition) = &spec.condition {
                    let value = render_value(condition, scope).unwrap_or(Value::Null);
                    if !truthy(&value) {
                        continue;
                    }
                }
                let include = if spec.include.is_empty() {
                    vec![IncludeKind::Output]
                } else {
                    spec.include.clone()
                };
                for kind in include {
                    match kind {
                        IncludeKind::Output => {
                            if let Some(output) = echo.outputs.get(&spec.cell) {
                                push_output_message(&spec, output, built);
                            }
                        }
                        IncludeKind::Messages => {
                            for message in echo
                                .history
                                .iter()
                                .filter(|m| m.source_cell() == Some(spec.cell.as_str()))
                            {
                                if let Some(filter) = &spec.messages_filter {
                                    if !message.content.contains(filter.as_str()) {
                                        continue;
                                    }
                                }
                                let mut injected = message.clone();
                                if let Some(role) = &spec.as_role {
                                    injected.role = role.clone();
                                }
                                if let Some(hash) = injected.content_hash() {
                                    built.context_hashes.push(hash.to_string());
                                }
                                built.messages.push(injected);
                            }
                        }
                        IncludeKind::State => {
                            let state = Value::Object(echo.state.clone());
                            built
                                .messages
                                .push(Message::system(format!("State: {}", compact(&state))));
                        }
                        IncludeKind::Images => {
                            // Image payloads live with the dashboard, an
                            // external collaborator.
                            tracing::debug!(
                                target: "rvbbit::context",
                                cell = %spec.cell,
                                "image include requested; no image store attached"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn build_auto(
        &self,
        config: &ContextConfig,
        echo: &Echo,
        query_text: &str,
        built: &mut BuiltContext,
    ) -> Result<(), ContextError> {
        let mut anchored: Vec<usize> = Vec::new();

        if let Some(anchors) = &config.anchors {
            for anchor in &anchors.cells {
                let mut turns = 0usize;
                for (index, message) in echo.history.iter().enumerate().rev() {
                    if message.source_cell() == Some(anchor.cell.as_str())
                        && message.has_role(Message::ASSISTANT)
                    {
                        anchored.push(index);
                        turns += 1;
                        if turns >= anchor.last_turns {
                            break;
                        }
                    }
                }
            }
            for slice in &anchors.include {
                match slice {
                    AnchorSlice::Output => {
                        if let Some(entry) = echo.lineage.last() {
                            if let Some(output) = echo.outputs.get(&entry.cell) {
                                let spec = ContextSourceSpec {
                                    cell: entry.cell.clone(),
                                    include: vec![IncludeKind::Output],
                                    messages_filter: None,
                                    images_filter: None,
                                    as_role: None,
                                    condition: None,
                                };
                                push_output_message(&spec, output, built);
                            }
                        }
                    }
                    AnchorSlice::Callouts => {
                        for (index, message) in echo.history.iter().enumerate() {
                            if message.callout().is_some() {
                                anchored.push(index);
                            }
                        }
                    }
                    AnchorSlice::Input => {
                        // include_input already covers the cascade input; an
                        // explicit anchor forces it even when disabled.
                        if !config.include_input {
                            if let Some(first) = echo.history.first() {
                                if first.has_role(Message::USER) {
                                    anchored.push(0);
                                }
                            }
                        }
                    }
                    AnchorSlice::Errors => {
                        for (index, message) in echo.history.iter().enumerate() {
                            if message.metadata.get("error").is_some() {
                                anchored.push(index);
                            }
                        }
                    }
                }
            }
        }

        anchored.sort_unstable();
        anchored.dedup();

        let selection = config.selection.clone().unwrap_or_default();
        let candidates: Vec<usize> = (0..echo.history.len())
            .filter(|index| !anchored.contains(index))
            .collect();
        let selected = self
            .select(&selection, echo, query_text, &candidates)
            .await;

        let mut chosen: Vec<usize> = anchored;
        chosen.extend(selected);
        chosen.sort_unstable();
        chosen.dedup();

        // Bound by messages first, then tokens, dropping the least recent.
        if let Some(max_messages) = selection.max_messages {
            while chosen.len() > max_messages {
                chosen.remove(0);
            }
        }
        if let Some(max_tokens) = selection.max_tokens {
            loop {
                let total: usize = chosen
                    .iter()
                    .map(|i| estimate_tokens(&echo.history[*i]))
                    .sum();
                if total <= max_tokens || chosen.len() <= 1 {
                    break;
                }
                chosen.remove(0);
            }
        }

        for index in chosen {
            let message = echo.history[index].clone();
            if let Some(hash) = message.content_hash() {
                built.context_hashes.push(hash.to_string());
            }
            built.messages.push(message);
        }
        Ok(())
    }

    async fn select(
        &self,
        selection: &SelectionConfig,
        echo: &Echo,
        query_text: &str,
        candidates: &[usize],
    ) -> Vec<usize> {
        if candidates.is_empty() {
            return Vec::new();
        }
        match selection.strategy {
            SelectionStrategy::Heuristic => {
                let mut scored = heuristic_scores(echo, query_text, candidates);
                scored.retain(|(_, score)| *score > 0.0);
                scored.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.0.cmp(&a.0))
                });
                scored.into_iter().map(|(index, _)| index).collect()
            }
            SelectionStrategy::Semantic => {
                self.semantic_select(selection, echo, query_text, candidates)
                    .await
            }
            SelectionStrategy::Llm => {
                self.llm_select(selection, echo, query_text, candidates).await
            }
            SelectionStrategy::Hybrid => {
                // Heuristic prefilter, then the model makes the final call.
                let mut scored = heuristic_scores(echo, query_text, candidates);
                scored.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.0.cmp(&a.0))
                });
                let cap = selection.max_messages.map(|m| m * 2).unwrap_or(20).max(4);
                let shortlist: Vec<usize> =
                    scored.into_iter().take(cap).map(|(index, _)| index).collect();
                self.llm_select(selection, echo, query_text, &shortlist)
                    .await
            }
        }
    }

    async fn semantic_select(
        &self,
        selection: &SelectionConfig,
        echo: &Echo,
        query_text: &str,
        candidates: &[usize],
    ) -> Vec<usize> {
        let mut texts = vec![query_text.to_string()];
        texts.extend(
            candidates
                .iter()
                .map(|index| echo.history[*index].content.clone()),
        );
        let response = match self.embedder.embed(&texts, &self.embed_model).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    target: "rvbbit::context",
                    error = %err,
                    "semantic selection fell back to heuristic"
                );
                return heuristic_scores(echo, query_text, candidates)
                    .into_iter()
                    .filter(|(_, score)| *score > 0.0)
                    .map(|(index, _)| index)
                    .collect();
            }
        };
        let Some((query_vec, rest)) = response.embeddings.split_first() else {
            return Vec::new();
        };
        let mut scored: Vec<(usize, f32)> = candidates
            .iter()
            .zip(rest)
            .map(|(index, vector)| (*index, crate::rag::cosine_similarity(query_vec, vector)))
            .filter(|(_, score)| *score >= selection.threshold)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.0.cmp(&a.0))
        });
        scored.into_iter().map(|(index, _)| index).collect()
    }

    async fn llm_select(
        &self,
        selection: &SelectionConfig,
        echo: &Echo,
        query_text: &str,
        candidates: &[usize],
    ) -> Vec<usize> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let summaries: Vec<String> = candidates
            .iter()
            .map(|index| {
                let message = &echo.history[*index];
                let preview: String = message.content.chars().take(160).collect();
                format!("[{index}] ({}) {preview}", message.role)
            })
            .collect();
        let prompt = format!(
            "Task instructions:\n{query_text}\n\nPrior messages:\n{}\n\n\
             Which messages are relevant context for the task? \
             Reply with ONLY a JSON array of the message indices, most relevant first.",
            summaries.join("\n")
        );
        let model = selection.model.as_deref().unwrap_or(&self.utility_model);
        let response = match self
            .chat
            .complete(ChatRequest::new(model, vec![Message::user(prompt)]))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    target: "rvbbit::context",
                    error = %err,
                    "llm selection fell back to heuristic"
                );
                return heuristic_scores(echo, query_text, candidates)
                    .into_iter()
                    .filter(|(_, score)| *score > 0.0)
                    .map(|(index, _)| index)
                    .collect();
            }
        };
        let picked: Vec<usize> = serde_json::from_str::<Vec<usize>>(response.content.trim())
            .unwrap_or_default();
        picked
            .into_iter()
            .filter(|index| candidates.contains(index))
            .collect()
    }
}

fn expand_source(source: &ContextSource, completed: &[String]) -> Vec<ContextSourceSpec> {
    let plain = |cell: &str| ContextSourceSpec {
        cell: cell.to_string(),
        include: Vec::new(),
        messages_filter: None,
        images_filter: None,
        as_role: None,
        condition: None,
    };
    match source {
        ContextSource::Cell(name) => match name.as_str() {
            "all" => completed.iter().map(|cell| plain(cell)).collect(),
            "first" => completed.first().map(|cell| vec![plain(cell)]).unwrap_or_default(),
            "previous" => completed.last().map(|cell| vec![plain(cell)]).unwrap_or_default(),
            other => vec![plain(other)],
        },
        ContextSource::Spec(spec) => vec![spec.clone()],
    }
}

fn push_output_message(spec: &ContextSourceSpec, output: &Value, built: &mut BuiltContext) {
    let role = spec.as_role.clone().unwrap_or_else(|| Message::USER.to_string());
    let hash = hashes::content_hash(output);
    let mut message = Message::new(
        role,
        format!("Output from {}: {}", spec.cell, compact(output)),
    );
    message.metadata.insert(
        Message::META_CONTENT_HASH.into(),
        Value::String(hash.clone()),
    );
    message
        .metadata
        .insert(Message::META_CELL.into(), Value::String(spec.cell.clone()));
    built.context_hashes.push(hash);
    built.messages.push(message);
}

fn heuristic_scores(echo: &Echo, query_text: &str, candidates: &[usize]) -> Vec<(usize, f64)> {
    let query_words: Vec<String> = significant_words(query_text);
    let total = echo.history.len().max(1) as f64;
    candidates
        .iter()
        .map(|index| {
            let message = &echo.history[*index];
            let message_words = significant_words(&message.content);
            let overlap = if query_words.is_empty() {
                0.0
            } else {
                let hits = query_words
                    .iter()
                    .filter(|word| message_words.contains(word))
                    .count();
                hits as f64 / query_words.len() as f64
            };
            let recency = (*index as f64 + 1.0) / total;
            let callout_bonus = if message.callout().is_some() { 1.0 } else { 0.0 };
            (*index, overlap * 0.5 + recency * 0.3 + callout_bonus * 0.2)
        })
        .collect()
}

fn significant_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 3)
        .map(str::to_string)
        .collect()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compact(value: &Value) -> String {
    hashes::canonical_json(value)
}

// ---------------------------------------------------------------------------
// Token budget enforcement
// ---------------------------------------------------------------------------

/// Apply the cascade token budget to a message list.
///
/// `summarize` needs a model; when the strategy asks for one and none is
/// configured the prunable prefix falls back to sliding-window.
pub async fn apply_token_budget(
    messages: Vec<Message>,
    budget: &TokenBudgetConfig,
    summarizer: Option<(&Arc<dyn ChatClient>, &str)>,
) -> Result<Vec<Message>, ContextError> {
    let available = budget.max_total.saturating_sub(budget.reserve_for_output);
    let total = estimate_total_tokens(&messages);
    if total <= available {
        return Ok(messages);
    }

    match budget.strategy {
        BudgetStrategy::Fail => Err(ContextError::BudgetExceeded {
            actual: total,
            max: budget.max_total,
        }),
        BudgetStrategy::SlidingWindow => Ok(sliding_window(messages, available)),
        BudgetStrategy::PruneOldest => {
            let mut messages = messages;
            while estimate_total_tokens(&messages) > available && messages.len() > 1 {
                let victim = messages
                    .iter()
                    .position(|m| !m.has_role(Message::SYSTEM))
                    .unwrap_or(0);
                messages.remove(victim);
            }
            if estimate_total_tokens(&messages) > available {
                return Ok(sliding_window(messages, available));
            }
            Ok(messages)
        }
        BudgetStrategy::Summarize => {
            let Some((client, model)) = summarizer else {
                return Ok(sliding_window(messages, available));
            };
            let keep_tail = 2.min(messages.len());
            let split = messages.len() - keep_tail;
            if split == 0 {
                return Ok(sliding_window(messages, available));
            }
            let prefix: Vec<String> = messages[..split]
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect();
            let prompt = format!(
                "Summarize this conversation prefix in a dense paragraph, \
                 preserving facts, decisions, and identifiers:\n\n{}",
                prefix.join("\n")
            );
            let model = budget.summarizer_model.as_deref().unwrap_or(model);
            let summary = client
                .complete(ChatRequest::new(model, vec![Message::user(prompt)]))
                .await
                .map(|response| response.content)
                .unwrap_or_else(|_| "(summary unavailable)".to_string());

            let mut result = vec![Message::system(format!(
                "Summary of earlier context: {summary}"
            ))];
            result.extend_from_slice(&messages[split..]);
            if estimate_total_tokens(&result) > available {
                return Ok(sliding_window(result, available));
            }
            Ok(result)
        }
    }
}

/// Most recent messages that fit; the newest message always survives, with
/// content truncated if it alone exceeds the budget.
fn sliding_window(messages: Vec<Message>, available: usize) -> Vec<Message> {
    let mut kept: Vec<Message> = Vec::new();
    let mut used = 0usize;
    for message in messages.into_iter().rev() {
        let cost = estimate_tokens(&message);
        if kept.is_empty() {
            // Newest message always survives.
            if cost > available {
                let mut truncated = message.clone();
                truncated.content = truncated
                    .content
                    .chars()
                    .take(available.saturating_mul(4))
                    .collect();
                used += estimate_tokens(&truncated);
                kept.push(truncated);
            } else {
                used += cost;
                kept.push(message);
            }
            continue;
        }
        if used + cost > available {
            break;
        }
        used += cost;
        kept.push(message);
    }
    kept.reverse();
    kept
}

// ---------------------------------------------------------------------------
// Intra-cell compression
// ---------------------------------------------------------------------------

/// Mask tool-result messages older than `window` turns.
///
/// A turn boundary is an assistant message. Reasoning stays intact; only
/// tool payloads are collapsed to a placeholder.
#[must_use]
pub fn mask_stale_tool_results(mut messages: Vec<Message>, window: usize) -> Vec<Message> {
    let assistant_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.has_role(Message::ASSISTANT))
        .map(|(i, _)| i)
        .collect();
    if assistant_positions.len() <= window {
        return messages;
    }
    let cutoff = assistant_positions[assistant_positions.len() - window];
    for message in messages.iter_mut().take(cutoff) {
        if message.has_role(Message::TOOL) && !message.content.starts_with("[tool result masked") {
            let chars = message.content.chars().count();
            message.content = format!("[tool result masked: {chars} chars]");
        }
    }
    messages
}

/// In loop_until cells, retain only the last `limit` prior attempts.
///
/// The leading prefix (system prompt, task input) survives; older
/// assistant attempts and their correction messages are dropped.
#[must_use]
pub fn limit_loop_history(messages: Vec<Message>, limit: usize) -> Vec<Message> {
    let assistant_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.has_role(Message::ASSISTANT))
        .map(|(i, _)| i)
        .collect();
    if assistant_positions.len() <= limit {
        return messages;
    }
    let first_assistant = assistant_positions[0];
    let cutoff = assistant_positions[assistant_positions.len() - limit];
    let mut result: Vec<Message> = messages[..first_assistant].to_vec();
    result.extend_from_slice(&messages[cutoff..]);
    result
}

/// Drop old conversation turns, keeping system messages and the most
/// recent `keep_recent` turns. Applying it twice equals applying it once.
#[must_use]
pub fn cull_old_conversation_history(messages: Vec<Message>, keep_recent: usize) -> Vec<Message> {
    const CULL_MARKER: &str = "[Earlier conversation history culled:";

    let non_system: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.has_role(Message::SYSTEM))
        .map(|(i, _)| i)
        .collect();
    let keep_messages = keep_recent * 2;
    if non_system.len() <= keep_messages {
        return messages;
    }
    let cutoff = non_system[non_system.len() - keep_messages];
    let culled = non_system.iter().filter(|i| **i < cutoff).count();

    let mut result: Vec<Message> = Vec::with_capacity(messages.len());
    for (index, message) in messages.iter().enumerate() {
        if index >= cutoff {
            break;
        }
        if message.has_role(Message::SYSTEM) && !message.content.starts_with(CULL_MARKER) {
            result.push(message.clone());
        }
    }
    result.push(Message::system(format!(
        "{CULL_MARKER} {culled} messages]"
    )));
    result.extend_from_slice(&messages[cutoff..]);
    result
}
