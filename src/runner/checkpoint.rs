//! Checkpoint persistence for suspended sessions.
//!
//! A suspension serializes `(echo snapshot, next cell, resume mode)` keyed
//! by a single-use resume token. Re-entry is a pure function from
//! `(checkpoint, response)` to continued execution, so the store only needs
//! save, take, and list.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::outcome::{RunnerError, SuspendedSession};

/// Storage for suspended sessions.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, suspended: SuspendedSession) -> Result<(), RunnerError>;

    /// Remove and return the suspension for a token.
    async fn take(&self, resume_token: &str) -> Result<Option<SuspendedSession>, RunnerError>;

    async fn list_tokens(&self) -> Result<Vec<String>, RunnerError>;
}

/// Volatile in-process checkpoint store.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<FxHashMap<String, SuspendedSession>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, suspended: SuspendedSession) -> Result<(), RunnerError> {
        self.inner
            .write()
            .insert(suspended.resume_token.clone(), suspended);
        Ok(())
    }

    async fn take(&self, resume_token: &str) -> Result<Option<SuspendedSession>, RunnerError> {
        Ok(self.inner.write().remove(resume_token))
    }

    async fn list_tokens(&self) -> Result<Vec<String>, RunnerError> {
        Ok(self.inner.read().keys().cloned().collect())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteCheckpointStore;

#[cfg(feature = "sqlite")]
mod sqlite_store {
    use super::*;
    use sqlx::{Row, SqlitePool};
    use std::sync::Arc;

    const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS checkpoints (
        resume_token TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    "#;

    /// Durable checkpoint store; suspensions survive process restarts.
    pub struct SqliteCheckpointStore {
        pool: Arc<SqlitePool>,
    }

    impl SqliteCheckpointStore {
        pub async fn connect(database_url: &str) -> Result<Self, RunnerError> {
            let pool = SqlitePool::connect(database_url)
                .await
                .map_err(|e| RunnerError::CheckpointStore(e.to_string()))?;
            sqlx::raw_sql(SCHEMA)
                .execute(&pool)
                .await
                .map_err(|e| RunnerError::CheckpointStore(e.to_string()))?;
            Ok(Self {
                pool: Arc::new(pool),
            })
        }

        pub async fn from_pool(pool: Arc<SqlitePool>) -> Result<Self, RunnerError> {
            sqlx::raw_sql(SCHEMA)
                .execute(pool.as_ref())
                .await
                .map_err(|e| RunnerError::CheckpointStore(e.to_string()))?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl CheckpointStore for SqliteCheckpointStore {
        async fn save(&self, suspended: SuspendedSession) -> Result<(), RunnerError> {
            let payload = serde_json::to_string(&suspended)
                .map_err(|e| RunnerError::CheckpointStore(e.to_string()))?;
            sqlx::query(
                "INSERT OR REPLACE INTO checkpoints (resume_token, session_id, payload_json, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&suspended.resume_token)
            .bind(&suspended.session_id)
            .bind(payload)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| RunnerError::CheckpointStore(e.to_string()))?;
            Ok(())
        }

        async fn take(
            &self,
            resume_token: &str,
        ) -> Result<Option<SuspendedSession>, RunnerError> {
            let row = sqlx::query("SELECT payload_json FROM checkpoints WHERE resume_token = ?")
                .bind(resume_token)
                .fetch_optional(self.pool.as_ref())
                .await
                .map_err(|e| RunnerError::CheckpointStore(e.to_string()))?;
            let Some(row) = row else {
                return Ok(None);
            };
            let payload: String = row.get("payload_json");
            let suspended: SuspendedSession = serde_json::from_str(&payload)
                .map_err(|e| RunnerError::CheckpointStore(e.to_string()))?;
            sqlx::query("DELETE FROM checkpoints WHERE resume_token = ?")
                .bind(resume_token)
                .execute(self.pool.as_ref())
                .await
                .map_err(|e| RunnerError::CheckpointStore(e.to_string()))?;
            Ok(Some(suspended))
        }

        async fn list_tokens(&self) -> Result<Vec<String>, RunnerError> {
            let rows = sqlx::query("SELECT resume_token FROM checkpoints")
                .fetch_all(self.pool.as_ref())
                .await
                .map_err(|e| RunnerError::CheckpointStore(e.to_string()))?;
            Ok(rows.iter().map(|row| row.get("resume_token")).collect())
        }
    }
}
