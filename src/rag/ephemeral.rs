//! Ephemeral RAG: automatic indexing of large content for one cell.
//!
//! Content bigger than the threshold would blow the context window, so it
//! is chunked, embedded, and indexed under a session-and-cell-scoped
//! `rag_id`, then replaced by a placeholder plus a generated search tool.
//! The model reaches the content through search instead of carrying it
//! inline. The scope deletes everything it created on close; a cell exit,
//! clean or not, leaves zero chunks behind.
//!
//! One scope per cell execution. The scope is not thread-safe by design;
//! candidate attempts each own their own.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::hashes::short_hash;
use crate::message::Message;
use crate::provider::{ChatClient, ChatRequest, EmbeddingClient, ToolSchema};

use super::chunker::chunk_text;
use super::index::RagIndexError;
use super::store::{ChunkRow, ChunkStore};

/// Tracks one large content item replaced by a search tool.
#[derive(Clone, Debug)]
pub struct LargeContentReplacement {
    pub source: String,
    pub original_size: usize,
    pub original_type: &'static str,
    pub rag_id: String,
    pub chunk_count: usize,
    pub tool_name: String,
    pub placeholder: String,
    pub content_hash: String,
}

/// A generated search tool over one ephemeral index.
#[derive(Clone, Debug)]
pub struct EphemeralSearchTool {
    pub tool_name: String,
    pub rag_id: String,
    pub source: String,
    pub original_size: usize,
    pub chunk_count: usize,
}

impl EphemeralSearchTool {
    /// Schema injected into the LLM's available tools.
    #[must_use]
    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.tool_name.clone(),
            description: format!(
                "Search '{}' ({} chars, {} sections) for relevant content using semantic search.",
                self.source, self.original_size, self.chunk_count
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Natural language search query"},
                    "limit": {"type": "integer", "description": "Maximum sections to return", "default": 5},
                    "smart": {"type": "boolean", "description": "LLM-filtered results", "default": true}
                },
                "required": ["query"]
            }),
        }
    }
}

/// Configuration for an ephemeral scope.
#[derive(Clone, Debug)]
pub struct EphemeralConfig {
    /// Strictly-greater-than character trigger.
    pub threshold: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embed_model: String,
}

/// Per-cell manager for large-content indexing.
pub struct EphemeralRag {
    session_id: String,
    cell_name: String,
    config: EphemeralConfig,
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingClient>,
    replacements: Vec<LargeContentReplacement>,
    tools: Vec<EphemeralSearchTool>,
    closed: bool,
}

impl EphemeralRag {
    #[must_use]
    pub fn new(
        session_id: &str,
        cell_name: &str,
        config: EphemeralConfig,
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            cell_name: cell_name.to_string(),
            config,
            store,
            embedder,
            replacements: Vec::new(),
            tools: Vec::new(),
            closed: false,
        }
    }

    /// Walk template data, replacing large values with placeholders.
    pub async fn process_template_data(&mut self, data: Value, prefix: &str) -> Value {
        match data {
            Value::String(text) => {
                let source = if prefix.is_empty() { "value" } else { prefix };
                self.check_and_replace(Value::String(text), source).await.0
            }
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, inner) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    out.insert(key, Box::pin(self.process_template_data(inner, &path)).await);
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let path = format!("{prefix}[{i}]");
                    out.push(Box::pin(self.process_template_data(item, &path)).await);
                }
                Value::Array(out)
            }
            other => other,
        }
    }

    /// Gate a tool result; oversized results become placeholders and a
    /// search tool.
    pub async fn process_tool_result(
        &mut self,
        tool_name: &str,
        result: Value,
    ) -> (Value, Option<String>) {
        self.check_and_replace(result, &format!("tool:{tool_name}"))
            .await
    }

    /// Gate content injected from a prior cell.
    pub async fn process_context_injection(
        &mut self,
        cell_name: &str,
        content: Value,
    ) -> (Value, Option<String>) {
        self.check_and_replace(content, &format!("context:{cell_name}"))
            .await
    }

    /// Final gatekeeper before anything lands in the message list.
    pub async fn check_message_content(
        &mut self,
        content: Value,
        source: &str,
    ) -> (Value, Option<String>) {
        self.check_and_replace(content, source).await
    }

    /// Tools created so far, in creation order.
    #[must_use]
    pub fn tools(&self) -> &[EphemeralSearchTool] {
        &self.tools
    }

    #[must_use]
    pub fn tool(&self, tool_name: &str) -> Option<&EphemeralSearchTool> {
        self.tools.iter().find(|t| t.tool_name == tool_name)
    }

    #[must_use]
    pub fn replacements(&self) -> &[LargeContentReplacement] {
        &self.replacements
    }

    /// Execute a generated search tool.
    pub async fn search(
        &self,
        tool_name: &str,
        query: &str,
        limit: usize,
        smart: bool,
        reranker: Option<(&Arc<dyn ChatClient>, &str)>,
    ) -> Result<String, RagIndexError> {
        let Some(tool) = self.tool(tool_name) else {
            return Ok(format!("No ephemeral index behind tool '{tool_name}'"));
        };
        let embedded = self
            .embedder
            .embed(&[query.to_string()], &self.config.embed_model)
            .await
            .map_err(|e| RagIndexError::Embed(e.to_string()))?;
        let query_vector = embedded
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| RagIndexError::Embed("empty embedding response".to_string()))?;

        let fetch = if smart { limit * 3 } else { limit };
        let mut hits = self.store.search(&tool.rag_id, &query_vector, fetch).await?;
        let mut synthesis = None;

        if smart {
            if let Some((client, model)) = reranker {
                let summaries: Vec<String> = hits
                    .iter()
                    .enumerate()
                    .map(|(i, hit)| format!("[{i}] {}", hit.snippet))
                    .collect();
                let prompt = format!(
                    "Query: {query}\n\nSections from '{}':\n{}\n\n\
                     Reply with JSON: {{\"keep\": [at most {limit} indices, most relevant first], \
                     \"synthesis\": \"one sentence summary\"}}",
                    tool.source,
                    summaries.join("\n")
                );
                if let Ok(response) = client
                    .complete(ChatRequest::new(model, vec![Message::user(prompt)]))
                    .await
                {
                    if let Ok(parsed) = serde_json::from_str::<Value>(response.content.trim()) {
                        if let Some(keep) = parsed.get("keep").and_then(Value::as_array) {
                            let indices: Vec<usize> = keep
                                .iter()
                                .filter_map(Value::as_u64)
                                .map(|v| v as usize)
                                .collect();
                            if !indices.is_empty() {
                                hits = indices
                                    .into_iter()
                                    .filter_map(|i| hits.get(i).cloned())
                                    .collect();
                            }
                        }
                        synthesis = parsed
                            .get("synthesis")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                }
            }
        }
        hits.truncate(limit);

        if hits.is_empty() {
            return Ok(format!(
                "No relevant sections found in '{}' for query: {query}",
                tool.source
            ));
        }

        let mut lines = Vec::new();
        if let Some(summary) = synthesis {
            lines.push(format!("**Summary**: {summary}\n"));
        }
        lines.push(format!(
            "Found {} relevant sections in '{}':\n",
            hits.len(),
            tool.source
        ));
        for (i, hit) in hits.iter().enumerate() {
            lines.push(format!(
                "[{}] (chars {}-{}, relevance: {:.2})",
                i + 1,
                hit.char_start,
                hit.char_end,
                hit.score
            ));
            lines.push(hit.snippet.clone());
            lines.push(String::new());
        }
        Ok(lines.join("\n"))
    }

    /// Delete every index this scope created. Must run on cell exit,
    /// whatever the outcome.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for replacement in &self.replacements {
            match self.store.delete_rag(&replacement.rag_id).await {
                Ok(removed) => {
                    tracing::debug!(
                        target: "rvbbit::rag",
                        rag_id = %replacement.rag_id,
                        removed,
                        "ephemeral index cleaned up"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "rvbbit::rag",
                        rag_id = %replacement.rag_id,
                        error = %err,
                        "ephemeral cleanup failed"
                    );
                }
            }
        }
        self.replacements.clear();
        self.tools.clear();
    }

    async fn check_and_replace(&mut self, content: Value, source: &str) -> (Value, Option<String>) {
        match &content {
            Value::String(text) => {
                if text.chars().count() > self.config.threshold {
                    let text = text.clone();
                    let (placeholder, tool) = self.index_and_replace(text, source, "string").await;
                    return (Value::String(placeholder), tool);
                }
                (content, None)
            }
            Value::Object(_) | Value::Array(_) => {
                let original_type = if content.is_object() { "dict" } else { "list" };
                let serialized = content.to_string();
                if serialized.chars().count() > self.config.threshold {
                    let (placeholder, tool) = self
                        .index_and_replace(serialized, source, original_type)
                        .await;
                    return (Value::String(placeholder), tool);
                }
                (content, None)
            }
            _ => (content, None),
        }
    }

    async fn index_and_replace(
        &mut self,
        content: String,
        source: &str,
        original_type: &'static str,
    ) -> (String, Option<String>) {
        let content_hash = short_hash(content.as_bytes());
        let safe_source = sanitize_name(source);
        let rag_id = format!(
            "ephemeral_{}_{}_{}_{}",
            self.session_id, self.cell_name, safe_source, content_hash
        );

        // Same content indexed twice within the scope reuses the index.
        if let Some(existing) = self.replacements.iter().find(|r| r.rag_id == rag_id) {
            return (existing.placeholder.clone(), Some(existing.tool_name.clone()));
        }

        let chunks = chunk_text(&content, self.config.chunk_size, self.config.chunk_overlap);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = match self.embedder.embed(&texts, &self.config.embed_model).await {
            Ok(response) => response.embeddings,
            Err(err) => {
                tracing::warn!(
                    target: "rvbbit::rag",
                    source,
                    error = %err,
                    "ephemeral embedding failed; content passed through"
                );
                return (content, None);
            }
        };

        let rows: Vec<ChunkRow> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| ChunkRow {
                chunk_id: uuid::Uuid::new_v5(
                    &uuid::Uuid::NAMESPACE_DNS,
                    format!("{rag_id}_{}", chunk.index).as_bytes(),
                )
                .to_string(),
                rag_id: rag_id.clone(),
                doc_id: source.to_string(),
                rel_path: source.to_string(),
                chunk_index: chunk.index,
                text: chunk.text.clone(),
                char_start: chunk.char_start,
                char_end: chunk.char_end,
                start_line: 0,
                end_line: 0,
                content_hash: content_hash.clone(),
                embedding,
                embedding_model: self.config.embed_model.clone(),
            })
            .collect();
        let chunk_count = rows.len();
        if let Err(err) = self.store.insert_chunks(rows).await {
            tracing::error!(target: "rvbbit::rag", error = %err, "ephemeral chunk insert failed");
            return (content, None);
        }

        let tool_name = self.generate_tool_name(source);
        let type_note = if original_type == "string" {
            String::new()
        } else {
            format!(" (serialized from {original_type})")
        };
        let placeholder = format!(
            "[Large content from '{source}'{type_note}: {} chars, {chunk_count} searchable sections. \
             Use {tool_name}(query) to find relevant parts.]",
            content.chars().count()
        );

        tracing::info!(
            target: "rvbbit::rag",
            source,
            chars = content.chars().count(),
            chunks = chunk_count,
            tool = %tool_name,
            "large content indexed"
        );

        self.tools.push(EphemeralSearchTool {
            tool_name: tool_name.clone(),
            rag_id: rag_id.clone(),
            source: source.to_string(),
            original_size: content.chars().count(),
            chunk_count,
        });
        self.replacements.push(LargeContentReplacement {
            source: source.to_string(),
            original_size: content.chars().count(),
            original_type,
            rag_id,
            chunk_count,
            tool_name: tool_name.clone(),
            placeholder: placeholder.clone(),
            content_hash,
        });

        (placeholder, Some(tool_name))
    }

    fn generate_tool_name(&mut self, source: &str) -> String {
        let base = if let Some(rest) = source.strip_prefix("tool:") {
            format!("search_{rest}_result")
        } else if let Some(rest) = source.strip_prefix("context:") {
            format!("search_{rest}_output")
        } else if let Some((_, last)) = source.rsplit_once('.') {
            format!("search_{last}")
        } else {
            format!("search_{source}")
        };
        let base = sanitize_name(&base);

        let mut candidate = base.clone();
        let mut counter = 1;
        while self.tools.iter().any(|t| t.tool_name == candidate) {
            candidate = format!("{base}_{counter}");
            counter += 1;
        }
        candidate
    }
}

impl Drop for EphemeralRag {
    fn drop(&mut self) {
        if !self.closed && !self.replacements.is_empty() {
            // Async deletion cannot run here; the runner owns calling
            // close() on every exit path.
            tracing::warn!(
                target: "rvbbit::rag",
                session = %self.session_id,
                cell = %self.cell_name,
                "ephemeral scope dropped without close()"
            );
        }
    }
}

fn sanitize_name(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut last_underscore = false;
    for c in source.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            last_underscore = c == '_';
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "content".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_special_chars() {
        assert_eq!(sanitize_name("tool:sql_data"), "tool_sql_data");
        assert_eq!(sanitize_name("input.document"), "input_document");
        assert_eq!(sanitize_name("__"), "content");
    }
}
