//! Retrieval substrates: chunking, chunk storage, persistent directory
//! indexes, and the ephemeral per-cell manager.

pub mod chunker;
mod ephemeral;
mod index;
#[cfg(feature = "sqlite")]
mod sqlite;
mod store;

pub use chunker::{chunk_text, Chunk};
pub use ephemeral::{
    EphemeralConfig, EphemeralRag, EphemeralSearchTool, LargeContentReplacement,
};
pub use index::{RagBuildStats, RagContext, RagIndexConfig, RagIndexError, RagIndexer};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteChunkStore;
pub use store::{
    cosine_similarity, ChunkHit, ChunkRow, ChunkStore, ChunkStoreError, InMemoryChunkStore,
    ManifestEntry,
};
