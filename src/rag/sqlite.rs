//! SQLite-backed chunk store.
//!
//! Embeddings serialize as JSON arrays; cosine ranking runs in process
//! after narrowing to the rag_id. Database-native vector search belongs to
//! the production columnar store, which is an external collaborator.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use super::store::{
    cosine_similarity, hit_from_row, ChunkHit, ChunkRow, ChunkStore, ChunkStoreError,
    ManifestEntry,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rag_chunks (
    chunk_id TEXT PRIMARY KEY,
    rag_id TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    rel_path TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    char_start INTEGER NOT NULL,
    char_end INTEGER NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    embedding TEXT NOT NULL,
    embedding_model TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rag_chunks_rag ON rag_chunks (rag_id, doc_id, chunk_index);
CREATE TABLE IF NOT EXISTS rag_manifest (
    rag_id TEXT NOT NULL,
    rel_path TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    size INTEGER NOT NULL,
    mtime REAL NOT NULL,
    chunk_count INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    PRIMARY KEY (rag_id, rel_path)
);
"#;

/// Chunk store persisted to SQLite through `sqlx`.
pub struct SqliteChunkStore {
    pool: Arc<SqlitePool>,
}

impl SqliteChunkStore {
    pub async fn connect(database_url: &str) -> Result<Self, ChunkStoreError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(backend)?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(backend)?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn from_pool(pool: Arc<SqlitePool>) -> Result<Self, ChunkStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(pool.as_ref())
            .await
            .map_err(backend)?;
        Ok(Self { pool })
    }

    async fn rows_for_rag(&self, rag_id: &str) -> Result<Vec<ChunkRow>, ChunkStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM rag_chunks WHERE rag_id = ? ORDER BY doc_id, chunk_index",
        )
        .bind(rag_id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|row| {
                let embedding: String = row.get("embedding");
                Ok(ChunkRow {
                    chunk_id: row.get("chunk_id"),
                    rag_id: row.get("rag_id"),
                    doc_id: row.get("doc_id"),
                    rel_path: row.get("rel_path"),
                    chunk_index: row.get::<i64, _>("chunk_index") as usize,
                    text: row.get("text"),
                    char_start: row.get::<i64, _>("char_start") as usize,
                    char_end: row.get::<i64, _>("char_end") as usize,
                    start_line: row.get::<i64, _>("start_line") as usize,
                    end_line: row.get::<i64, _>("end_line") as usize,
                    content_hash: row.get("content_hash"),
                    embedding: serde_json::from_str(&embedding).map_err(|e| {
                        ChunkStoreError::Backend {
                            message: format!("embedding decode: {e}"),
                        }
                    })?,
                    embedding_model: row.get("embedding_model"),
                })
            })
            .collect()
    }
}

fn backend(err: sqlx::Error) -> ChunkStoreError {
    ChunkStoreError::Backend {
        message: err.to_string(),
    }
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn insert_chunks(&self, rows: Vec<ChunkRow>) -> Result<(), ChunkStoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        if let Some(new_dim) = rows.first().map(|r| r.embedding.len()) {
            if let Some(existing) = self.embedding_dim(&rows[0].rag_id).await? {
                if existing != new_dim {
                    return Err(ChunkStoreError::DimensionDrift {
                        rag_id: rows[0].rag_id.clone(),
                        existing,
                        new: new_dim,
                    });
                }
            }
        }
        for row in rows {
            let embedding = serde_json::to_string(&row.embedding).map_err(|e| {
                ChunkStoreError::Backend {
                    message: e.to_string(),
                }
            })?;
            sqlx::query(
                r#"INSERT OR REPLACE INTO rag_chunks (
                    chunk_id, rag_id, doc_id, rel_path, chunk_index, text,
                    char_start, char_end, start_line, end_line,
                    content_hash, embedding, embedding_model
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&row.chunk_id)
            .bind(&row.rag_id)
            .bind(&row.doc_id)
            .bind(&row.rel_path)
            .bind(row.chunk_index as i64)
            .bind(&row.text)
            .bind(row.char_start as i64)
            .bind(row.char_end as i64)
            .bind(row.start_line as i64)
            .bind(row.end_line as i64)
            .bind(&row.content_hash)
            .bind(embedding)
            .bind(&row.embedding_model)
            .execute(self.pool.as_ref())
            .await
            .map_err(backend)?;
        }
        Ok(())
    }

    async fn delete_rag(&self, rag_id: &str) -> Result<u64, ChunkStoreError> {
        let result = sqlx::query("DELETE FROM rag_chunks WHERE rag_id = ?")
            .bind(rag_id)
            .execute(self.pool.as_ref())
            .await
            .map_err(backend)?;
        sqlx::query("DELETE FROM rag_manifest WHERE rag_id = ?")
            .bind(rag_id)
            .execute(self.pool.as_ref())
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn delete_doc(&self, rag_id: &str, doc_id: &str) -> Result<u64, ChunkStoreError> {
        let result = sqlx::query("DELETE FROM rag_chunks WHERE rag_id = ? AND doc_id = ?")
            .bind(rag_id)
            .bind(doc_id)
            .execute(self.pool.as_ref())
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn count_chunks(&self, rag_id: &str) -> Result<u64, ChunkStoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM rag_chunks WHERE rag_id = ?")
            .bind(rag_id)
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(backend)?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn embedding_dim(&self, rag_id: &str) -> Result<Option<usize>, ChunkStoreError> {
        let row = sqlx::query("SELECT embedding FROM rag_chunks WHERE rag_id = ? LIMIT 1")
            .bind(rag_id)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(backend)?;
        match row {
            Some(row) => {
                let embedding: String = row.get("embedding");
                let vector: Vec<f32> =
                    serde_json::from_str(&embedding).map_err(|e| ChunkStoreError::Backend {
                        message: e.to_string(),
                    })?;
                Ok(Some(vector.len()))
            }
            None => Ok(None),
        }
    }

    async fn search(
        &self,
        rag_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ChunkHit>, ChunkStoreError> {
        let rows = self.rows_for_rag(rag_id).await?;
        let mut scored: Vec<ChunkHit> = rows
            .iter()
            .map(|row| hit_from_row(row, cosine_similarity(&row.embedding, query_embedding)))
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn manifest(&self, rag_id: &str) -> Result<Vec<ManifestEntry>, ChunkStoreError> {
        let rows = sqlx::query("SELECT * FROM rag_manifest WHERE rag_id = ?")
            .bind(rag_id)
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|row| ManifestEntry {
                rag_id: row.get("rag_id"),
                rel_path: row.get("rel_path"),
                doc_id: row.get("doc_id"),
                size: row.get::<i64, _>("size") as u64,
                mtime: row.get("mtime"),
                chunk_count: row.get::<i64, _>("chunk_count") as usize,
                content_hash: row.get("content_hash"),
            })
            .collect())
    }

    async fn upsert_manifest(&self, entry: ManifestEntry) -> Result<(), ChunkStoreError> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO rag_manifest (
                rag_id, rel_path, doc_id, size, mtime, chunk_count, content_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&entry.rag_id)
        .bind(&entry.rel_path)
        .bind(&entry.doc_id)
        .bind(entry.size as i64)
        .bind(entry.mtime)
        .bind(entry.chunk_count as i64)
        .bind(&entry.content_hash)
        .execute(self.pool.as_ref())
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn delete_manifest_entries(
        &self,
        rag_id: &str,
        rel_paths: &[String],
    ) -> Result<(), ChunkStoreError> {
        for rel_path in rel_paths {
            sqlx::query("DELETE FROM rag_manifest WHERE rag_id = ? AND rel_path = ?")
                .bind(rag_id)
                .bind(rel_path)
                .execute(self.pool.as_ref())
                .await
                .map_err(backend)?;
        }
        Ok(())
    }
}
