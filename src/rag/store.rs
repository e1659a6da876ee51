//! Chunk storage: the shared table every RAG index lives in.
//!
//! Chunks from persistent directory indexes and ephemeral per-cell indexes
//! share one store, scoped by `rag_id`. The arena is the table; lifetimes
//! are enforced by scope owners deleting their own rag_ids. The manifest
//! table carries per-file `(size, mtime)` entries that make directory
//! rebuilds incremental.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One stored chunk row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub rag_id: String,
    pub doc_id: String,
    /// Relative path for files, source path for ephemeral content.
    pub rel_path: String,
    pub chunk_index: usize,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub embedding_model: String,
}

/// Manifest entry: the reuse key for a file in a directory index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub rag_id: String,
    pub rel_path: String,
    pub doc_id: String,
    pub size: u64,
    /// Seconds since epoch, fractional.
    pub mtime: f64,
    pub chunk_count: usize,
    pub content_hash: String,
}

/// A search hit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub source: String,
    pub lines: (usize, usize),
    pub score: f32,
    pub snippet: String,
    pub char_start: usize,
    pub char_end: usize,
}

/// Errors from chunk store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ChunkStoreError {
    #[error("chunk store backend error: {message}")]
    #[diagnostic(code(rvbbit::rag::backend))]
    Backend { message: String },

    #[error("embedding dimension mismatch in index {rag_id}: existing {existing}, new {new}")]
    #[diagnostic(
        code(rvbbit::rag::dimension_drift),
        help("An index stores vectors of exactly one dimension. Delete the index and rebuild with the new embedding model.")
    )]
    DimensionDrift {
        rag_id: String,
        existing: usize,
        new: usize,
    },
}

/// Storage for RAG chunks and directory manifests.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert chunk rows, refusing mixed embedding dimensions per rag_id.
    async fn insert_chunks(&self, rows: Vec<ChunkRow>) -> Result<(), ChunkStoreError>;

    /// Delete every chunk with the given rag_id.
    async fn delete_rag(&self, rag_id: &str) -> Result<u64, ChunkStoreError>;

    /// Delete the chunks for one document within an index.
    async fn delete_doc(&self, rag_id: &str, doc_id: &str) -> Result<u64, ChunkStoreError>;

    /// Number of chunks in an index.
    async fn count_chunks(&self, rag_id: &str) -> Result<u64, ChunkStoreError>;

    /// Embedding dimension of an index, if it has chunks.
    async fn embedding_dim(&self, rag_id: &str) -> Result<Option<usize>, ChunkStoreError>;

    /// Cosine-similarity search over one index.
    async fn search(
        &self,
        rag_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ChunkHit>, ChunkStoreError>;

    /// Manifest rows for an index.
    async fn manifest(&self, rag_id: &str) -> Result<Vec<ManifestEntry>, ChunkStoreError>;

    /// Insert or replace a manifest entry.
    async fn upsert_manifest(&self, entry: ManifestEntry) -> Result<(), ChunkStoreError>;

    /// Remove manifest entries for paths no longer present.
    async fn delete_manifest_entries(
        &self,
        rag_id: &str,
        rel_paths: &[String],
    ) -> Result<(), ChunkStoreError>;
}

/// Cosine similarity; zero when either vector is zero or lengths differ.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn snippet_of(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}...")
    }
}

pub(crate) fn hit_from_row(row: &ChunkRow, score: f32) -> ChunkHit {
    ChunkHit {
        chunk_id: row.chunk_id.clone(),
        doc_id: row.doc_id.clone(),
        source: row.rel_path.clone(),
        lines: (row.start_line, row.end_line),
        score,
        snippet: snippet_of(&row.text, 600),
        char_start: row.char_start,
        char_end: row.char_end,
    }
}

/// In-process chunk store for tests and embedded runs.
#[derive(Default)]
pub struct InMemoryChunkStore {
    chunks: RwLock<Vec<ChunkRow>>,
    manifests: RwLock<Vec<ManifestEntry>>,
}

impl InMemoryChunkStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn insert_chunks(&self, rows: Vec<ChunkRow>) -> Result<(), ChunkStoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut chunks = self.chunks.write();
        for row in &rows {
            if let Some(existing) = chunks
                .iter()
                .find(|c| c.rag_id == row.rag_id)
                .map(|c| c.embedding.len())
            {
                if existing != row.embedding.len() {
                    return Err(ChunkStoreError::DimensionDrift {
                        rag_id: row.rag_id.clone(),
                        existing,
                        new: row.embedding.len(),
                    });
                }
            }
        }
        chunks.extend(rows);
        Ok(())
    }

    async fn delete_rag(&self, rag_id: &str) -> Result<u64, ChunkStoreError> {
        let mut chunks = self.chunks.write();
        let before = chunks.len();
        chunks.retain(|row| row.rag_id != rag_id);
        let removed = (before - chunks.len()) as u64;
        self.manifests.write().retain(|entry| entry.rag_id != rag_id);
        Ok(removed)
    }

    async fn delete_doc(&self, rag_id: &str, doc_id: &str) -> Result<u64, ChunkStoreError> {
        let mut chunks = self.chunks.write();
        let before = chunks.len();
        chunks.retain(|row| !(row.rag_id == rag_id && row.doc_id == doc_id));
        Ok((before - chunks.len()) as u64)
    }

    async fn count_chunks(&self, rag_id: &str) -> Result<u64, ChunkStoreError> {
        Ok(self
            .chunks
            .read()
            .iter()
            .filter(|row| row.rag_id == rag_id)
            .count() as u64)
    }

    async fn embedding_dim(&self, rag_id: &str) -> Result<Option<usize>, ChunkStoreError> {
        Ok(self
            .chunks
            .read()
            .iter()
            .find(|row| row.rag_id == rag_id)
            .map(|row| row.embedding.len()))
    }

    async fn search(
        &self,
        rag_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ChunkHit>, ChunkStoreError> {
        let chunks = self.chunks.read();
        let mut scored: Vec<ChunkHit> = chunks
            .iter()
            .filter(|row| row.rag_id == rag_id)
            .map(|row| hit_from_row(row, cosine_similarity(&row.embedding, query_embedding)))
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn manifest(&self, rag_id: &str) -> Result<Vec<ManifestEntry>, ChunkStoreError> {
        Ok(self
            .manifests
            .read()
            .iter()
            .filter(|entry| entry.rag_id == rag_id)
            .cloned()
            .collect())
    }

    async fn upsert_manifest(&self, entry: ManifestEntry) -> Result<(), ChunkStoreError> {
        let mut manifests = self.manifests.write();
        manifests.retain(|e| !(e.rag_id == entry.rag_id && e.rel_path == entry.rel_path));
        manifests.push(entry);
        Ok(())
    }

    async fn delete_manifest_entries(
        &self,
        rag_id: &str,
        rel_paths: &[String],
    ) -> Result<(), ChunkStoreError> {
        self.manifests
            .write()
            .retain(|e| !(e.rag_id == rag_id && rel_paths.contains(&e.rel_path)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(rag_id: &str, idx: usize, embedding: Vec<f32>) -> ChunkRow {
        ChunkRow {
            chunk_id: format!("{rag_id}_{idx}"),
            rag_id: rag_id.to_string(),
            doc_id: "doc".to_string(),
            rel_path: "doc.txt".to_string(),
            chunk_index: idx,
            text: format!("chunk {idx}"),
            char_start: idx * 10,
            char_end: idx * 10 + 10,
            start_line: 1,
            end_line: 1,
            content_hash: "h".to_string(),
            embedding,
            embedding_model: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn search_orders_by_cosine() {
        let store = InMemoryChunkStore::new();
        store
            .insert_chunks(vec![
                row("r", 0, vec![1.0, 0.0]),
                row("r", 1, vec![0.0, 1.0]),
                row("r", 2, vec![0.7, 0.7]),
            ])
            .await
            .unwrap();
        let hits = store.search("r", &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "r_0");
        assert_eq!(hits[1].chunk_id, "r_2");
    }

    #[tokio::test]
    async fn dimension_drift_is_refused() {
        let store = InMemoryChunkStore::new();
        store
            .insert_chunks(vec![row("r", 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        let err = store
            .insert_chunks(vec![row("r", 1, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkStoreError::DimensionDrift { .. }));
    }

    #[tokio::test]
    async fn delete_rag_scopes_to_one_index() {
        let store = InMemoryChunkStore::new();
        store
            .insert_chunks(vec![row("a", 0, vec![1.0]), row("b", 0, vec![1.0])])
            .await
            .unwrap();
        let removed = store.delete_rag("a").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count_chunks("b").await.unwrap(), 1);
    }
}
