//! Persistent directory-backed RAG indexes.
//!
//! An index is identified by a hash of everything that affects its content:
//! absolute directory, recursion, include/exclude patterns, chunking
//! parameters, and the embedding model. Rebuilding an unchanged directory
//! reuses every chunk by `(size, mtime)` and makes zero embedding calls.

use glob::Pattern;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::hashes::{canonical_json, short_hash};
use crate::message::Message;
use crate::provider::{ChatClient, ChatRequest, EmbeddingClient};

use super::chunker::chunk_text;
use super::store::{ChunkHit, ChunkRow, ChunkStore, ChunkStoreError, ManifestEntry};

/// Errors from index building and querying.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RagIndexError {
    #[error("RAG directory not found: {directory}")]
    #[diagnostic(code(rvbbit::rag::missing_dir))]
    MissingDirectory { directory: String },

    #[error(transparent)]
    #[diagnostic(code(rvbbit::rag::store))]
    Store(#[from] ChunkStoreError),

    #[error("embedding failed: {0}")]
    #[diagnostic(code(rvbbit::rag::embed))]
    Embed(String),

    #[error("io error on {path}: {source}")]
    #[diagnostic(code(rvbbit::rag::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Settings that define an index's identity.
#[derive(Clone, Debug)]
pub struct RagIndexConfig {
    pub directory: PathBuf,
    pub recursive: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub chunk_chars: usize,
    pub chunk_overlap: usize,
    pub embed_model: String,
}

impl RagIndexConfig {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, embed_model: &str) -> Self {
        Self {
            directory: directory.into(),
            recursive: true,
            include: vec!["*".to_string()],
            exclude: Vec::new(),
            chunk_chars: 1_200,
            chunk_overlap: 200,
            embed_model: embed_model.to_string(),
        }
    }

    /// Content-hash identity of this configuration.
    #[must_use]
    pub fn rag_id(&self) -> String {
        let mut include = self.include.clone();
        include.sort();
        let mut exclude = self.exclude.clone();
        exclude.sort();
        let key = json!({
            "directory": self.directory.to_string_lossy(),
            "recursive": self.recursive,
            "include": include,
            "exclude": exclude,
            "chunk_chars": self.chunk_chars,
            "chunk_overlap": self.chunk_overlap,
            "embed_model": self.embed_model,
        });
        short_hash(canonical_json(&key).as_bytes())
    }
}

/// Outcome of one build pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RagBuildStats {
    pub indexed_files: usize,
    pub skipped_files: usize,
    pub removed_files: usize,
    pub chunks_written: usize,
    pub chunks_reused: usize,
    pub total_files: usize,
    /// Provider embedding calls made (zero on an unchanged directory).
    pub embedding_calls: usize,
}

/// Handle to a built index.
#[derive(Clone, Debug)]
pub struct RagContext {
    pub rag_id: String,
    pub directory: PathBuf,
    pub embed_model: String,
    pub stats: RagBuildStats,
}

/// Builds and queries directory indexes against a chunk store.
pub struct RagIndexer {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl RagIndexer {
    #[must_use]
    pub fn new(store: Arc<dyn ChunkStore>, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { store, embedder }
    }

    /// Build or incrementally update the index for `config`.
    pub async fn ensure_index(&self, config: &RagIndexConfig) -> Result<RagContext, RagIndexError> {
        if !config.directory.is_dir() {
            return Err(RagIndexError::MissingDirectory {
                directory: config.directory.display().to_string(),
            });
        }
        let rag_id = config.rag_id();
        let existing_manifest = self.store.manifest(&rag_id).await?;
        let expected_dim = self.store.embedding_dim(&rag_id).await?;

        let candidates = list_candidate_files(config)?;
        let mut stats = RagBuildStats {
            total_files: candidates.len(),
            ..RagBuildStats::default()
        };

        // Gather all new chunks first so the whole build embeds in a single
        // provider call.
        struct PendingDoc {
            rel_path: String,
            doc_id: String,
            size: u64,
            mtime: f64,
            content_hash: String,
            chunks: Vec<super::chunker::Chunk>,
        }
        let mut pending: Vec<PendingDoc> = Vec::new();

        for path in &candidates {
            let rel_path = path
                .strip_prefix(&config.directory)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            let metadata = std::fs::metadata(path).map_err(|source| RagIndexError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let size = metadata.len();
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);

            if let Some(previous) = existing_manifest.iter().find(|e| e.rel_path == rel_path) {
                if previous.size == size && (previous.mtime - mtime).abs() < 1e-6 {
                    stats.skipped_files += 1;
                    stats.chunks_reused += previous.chunk_count;
                    continue;
                }
            }

            let Some(content) = read_text_file(path) else {
                stats.skipped_files += 1;
                continue;
            };
            let chunks = chunk_text(&content, config.chunk_chars, config.chunk_overlap);
            if chunks.is_empty() {
                stats.skipped_files += 1;
                continue;
            }

            let doc_id = short_hash(format!("{rag_id}:{rel_path}").as_bytes());
            let content_hash = short_hash(content.as_bytes());
            pending.push(PendingDoc {
                rel_path,
                doc_id,
                size,
                mtime,
                content_hash,
                chunks,
            });
        }

        if !pending.is_empty() {
            let texts: Vec<String> = pending
                .iter()
                .flat_map(|doc| doc.chunks.iter().map(|c| c.text.clone()))
                .collect();
            let embedded = self
                .embedder
                .embed(&texts, &config.embed_model)
                .await
                .map_err(|e| RagIndexError::Embed(e.to_string()))?;
            stats.embedding_calls = 1;

            if let Some(expected) = expected_dim {
                if embedded.dim != expected {
                    return Err(ChunkStoreError::DimensionDrift {
                        rag_id: rag_id.clone(),
                        existing: expected,
                        new: embedded.dim,
                    }
                    .into());
                }
            }

            let mut vectors = embedded.embeddings.into_iter();
            for doc in &pending {
                // Changed file: replace its chunks wholesale.
                self.store.delete_doc(&rag_id, &doc.doc_id).await?;
                let mut rows = Vec::with_capacity(doc.chunks.len());
                for chunk in &doc.chunks {
                    let embedding = vectors.next().unwrap_or_default();
                    rows.push(ChunkRow {
                        chunk_id: format!("{}_{}", doc.doc_id, chunk.index),
                        rag_id: rag_id.clone(),
                        doc_id: doc.doc_id.clone(),
                        rel_path: doc.rel_path.clone(),
                        chunk_index: chunk.index,
                        text: chunk.text.clone(),
                        char_start: chunk.char_start,
                        char_end: chunk.char_end,
                        start_line: chunk.start_line,
                        end_line: chunk.end_line,
                        content_hash: doc.content_hash.clone(),
                        embedding,
                        embedding_model: config.embed_model.clone(),
                    });
                }
                let written = rows.len();
                self.store.insert_chunks(rows).await?;
                self.store
                    .upsert_manifest(ManifestEntry {
                        rag_id: rag_id.clone(),
                        rel_path: doc.rel_path.clone(),
                        doc_id: doc.doc_id.clone(),
                        size: doc.size,
                        mtime: doc.mtime,
                        chunk_count: written,
                        content_hash: doc.content_hash.clone(),
                    })
                    .await?;
                stats.indexed_files += 1;
                stats.chunks_written += written;
            }
        }

        // Files that vanished since the last build lose their chunks and
        // manifest entries.
        let current: Vec<String> = candidates
            .iter()
            .map(|p| {
                p.strip_prefix(&config.directory)
                    .unwrap_or(p)
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        let removed: Vec<ManifestEntry> = existing_manifest
            .iter()
            .filter(|e| !current.contains(&e.rel_path))
            .cloned()
            .collect();
        for entry in &removed {
            self.store.delete_doc(&rag_id, &entry.doc_id).await?;
        }
        if !removed.is_empty() {
            let paths: Vec<String> = removed.iter().map(|e| e.rel_path.clone()).collect();
            self.store.delete_manifest_entries(&rag_id, &paths).await?;
            stats.removed_files = removed.len();
        }

        tracing::info!(
            target: "rvbbit::rag",
            rag_id = %rag_id,
            indexed = stats.indexed_files,
            reused = stats.chunks_reused,
            removed = stats.removed_files,
            "RAG index refreshed"
        );

        Ok(RagContext {
            rag_id,
            directory: config.directory.clone(),
            embed_model: config.embed_model.clone(),
            stats,
        })
    }

    /// Embed the query with the index's model and search.
    pub async fn query(
        &self,
        context: &RagContext,
        query: &str,
        k: usize,
    ) -> Result<Vec<ChunkHit>, RagIndexError> {
        let embedded = self
            .embedder
            .embed(&[query.to_string()], &context.embed_model)
            .await
            .map_err(|e| RagIndexError::Embed(e.to_string()))?;
        let query_vector = embedded
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| RagIndexError::Embed("empty embedding response".to_string()))?;
        Ok(self.store.search(&context.rag_id, &query_vector, k).await?)
    }

    /// Over-fetch, ask a cheap model to keep the relevant hits, and
    /// synthesize a short answer alongside them.
    pub async fn smart_query(
        &self,
        context: &RagContext,
        query: &str,
        k: usize,
        reranker: &Arc<dyn ChatClient>,
        model: &str,
    ) -> Result<(Vec<ChunkHit>, Option<String>), RagIndexError> {
        let raw = self.query(context, query, k * 3).await?;
        if raw.is_empty() {
            return Ok((raw, None));
        }
        let summaries: Vec<String> = raw
            .iter()
            .enumerate()
            .map(|(i, hit)| format!("[{i}] ({}) {}", hit.source, hit.snippet))
            .collect();
        let prompt = format!(
            "Query: {query}\n\nCandidate sections:\n{}\n\n\
             Reply with JSON: {{\"keep\": [indices of relevant sections, best first, at most {k}], \
             \"synthesis\": \"one short paragraph answering the query from the kept sections\"}}",
            summaries.join("\n")
        );
        let response = reranker
            .complete(ChatRequest::new(model, vec![Message::user(prompt)]))
            .await
            .map_err(|e| RagIndexError::Embed(e.to_string()))?;

        let parsed: Value = serde_json::from_str(response.content.trim()).unwrap_or(Value::Null);
        let keep: Vec<usize> = parsed
            .get("keep")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|v| v as usize)
                    .collect()
            })
            .unwrap_or_default();
        let synthesis = parsed
            .get("synthesis")
            .and_then(Value::as_str)
            .map(str::to_string);

        if keep.is_empty() {
            let mut hits = raw;
            hits.truncate(k);
            return Ok((hits, synthesis));
        }
        let kept: Vec<ChunkHit> = keep
            .into_iter()
            .filter_map(|i| raw.get(i).cloned())
            .take(k)
            .collect();
        Ok((kept, synthesis))
    }
}

fn list_candidate_files(config: &RagIndexConfig) -> Result<Vec<PathBuf>, RagIndexError> {
    let include: Vec<Pattern> = config
        .include
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();
    let exclude: Vec<Pattern> = config
        .exclude
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();

    let mut files = Vec::new();
    walk(&config.directory, config.recursive, &mut files).map_err(|source| RagIndexError::Io {
        path: config.directory.display().to_string(),
        source,
    })?;
    files.sort();

    Ok(files
        .into_iter()
        .filter(|path| {
            let rel = path
                .strip_prefix(&config.directory)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let excluded = exclude
                .iter()
                .any(|p| p.matches(&rel) || p.matches(&name));
            if excluded {
                return false;
            }
            include.is_empty()
                || include.iter().any(|p| p.matches(&rel) || p.matches(&name))
        })
        .collect())
}

fn walk(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                walk(&path, true, out)?;
            }
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Binary sniff on the first KiB: a null byte or >30% non-text bytes.
fn is_probably_binary(sample: &[u8]) -> bool {
    if sample.is_empty() {
        return false;
    }
    if sample.contains(&0) {
        return true;
    }
    let non_text = sample
        .iter()
        .filter(|b| !matches!(**b, 7..=13 | 27 | 0x20..=0xFF))
        .count();
    (non_text as f64) / (sample.len() as f64) > 0.30
}

fn read_text_file(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let sample = &bytes[..bytes.len().min(1024)];
    if is_probably_binary(sample) {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
