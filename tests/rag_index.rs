//! Persistent directory indexes: incremental rebuilds and drift refusal.

mod common;

use std::sync::Arc;

use common::{harness, ScriptedChat, StaticEmbedder};
use rvbbit::rag::{ChunkStore, InMemoryChunkStore, RagIndexConfig, RagIndexer};

fn write_file(dir: &std::path::Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

fn config_for(dir: &std::path::Path) -> RagIndexConfig {
    let mut config = RagIndexConfig::new(dir, "test-embed");
    config.chunk_chars = 200;
    config.chunk_overlap = 20;
    config
}

#[tokio::test]
async fn unchanged_directory_rebuild_adds_nothing_and_embeds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.txt", &"alpha content line.\n".repeat(30));
    write_file(dir.path(), "b.txt", &"beta content line.\n".repeat(30));

    let store: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
    let embedder = StaticEmbedder::new();
    let indexer = RagIndexer::new(Arc::clone(&store), embedder.clone());
    let config = config_for(dir.path());

    let first = indexer.ensure_index(&config).await.unwrap();
    assert_eq!(first.stats.indexed_files, 2);
    assert_eq!(first.stats.embedding_calls, 1, "one batch embed per build");
    let chunk_count = store.count_chunks(&first.rag_id).await.unwrap();
    assert!(chunk_count > 0);
    let calls_after_first = embedder.call_count();

    // Second build of an unchanged directory: full reuse.
    let second = indexer.ensure_index(&config).await.unwrap();
    assert_eq!(second.rag_id, first.rag_id);
    assert_eq!(second.stats.indexed_files, 0);
    assert_eq!(second.stats.skipped_files, 2);
    assert_eq!(second.stats.embedding_calls, 0);
    assert_eq!(embedder.call_count(), calls_after_first);
    assert_eq!(store.count_chunks(&first.rag_id).await.unwrap(), chunk_count);
}

#[tokio::test]
async fn changed_file_reindexes_only_that_file() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.txt", &"alpha line.\n".repeat(20));
    write_file(dir.path(), "b.txt", &"beta line.\n".repeat(20));

    let store: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
    let embedder = StaticEmbedder::new();
    let indexer = RagIndexer::new(Arc::clone(&store), embedder.clone());
    let config = config_for(dir.path());
    indexer.ensure_index(&config).await.unwrap();

    // Rewrite one file with different size (size change beats mtime
    // granularity on fast filesystems).
    write_file(dir.path(), "a.txt", &"completely new alpha.\n".repeat(25));
    let rebuilt = indexer.ensure_index(&config).await.unwrap();
    assert_eq!(rebuilt.stats.indexed_files, 1);
    assert_eq!(rebuilt.stats.skipped_files, 1);
}

#[tokio::test]
async fn removed_files_lose_their_chunks() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "keep.txt", &"keep me.\n".repeat(20));
    write_file(dir.path(), "drop.txt", &"drop me.\n".repeat(20));

    let store: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
    let embedder = StaticEmbedder::new();
    let indexer = RagIndexer::new(Arc::clone(&store), embedder.clone());
    let config = config_for(dir.path());
    let first = indexer.ensure_index(&config).await.unwrap();
    let initial = store.count_chunks(&first.rag_id).await.unwrap();

    std::fs::remove_file(dir.path().join("drop.txt")).unwrap();
    let rebuilt = indexer.ensure_index(&config).await.unwrap();
    assert_eq!(rebuilt.stats.removed_files, 1);
    assert!(store.count_chunks(&first.rag_id).await.unwrap() < initial);
    let manifest = store.manifest(&first.rag_id).await.unwrap();
    assert!(manifest.iter().all(|e| e.rel_path != "drop.txt"));
}

#[tokio::test]
async fn binary_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "text.txt", &"plain text.\n".repeat(20));
    std::fs::write(dir.path().join("blob.bin"), [0u8, 159, 146, 150, 0, 1, 2]).unwrap();

    let store: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
    let embedder = StaticEmbedder::new();
    let indexer = RagIndexer::new(Arc::clone(&store), embedder);
    let context = indexer.ensure_index(&config_for(dir.path())).await.unwrap();
    assert_eq!(context.stats.indexed_files, 1);
    assert_eq!(context.stats.skipped_files, 1);
}

#[tokio::test]
async fn include_exclude_patterns_filter_candidates() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "code.rs", &"fn main() {}\n".repeat(20));
    write_file(dir.path(), "notes.md", &"# notes\n".repeat(20));
    write_file(dir.path(), "junk.log", &"log line\n".repeat(20));

    let store: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
    let embedder = StaticEmbedder::new();
    let indexer = RagIndexer::new(Arc::clone(&store), embedder);
    let mut config = config_for(dir.path());
    config.include = vec!["*.rs".to_string(), "*.md".to_string()];
    config.exclude = vec!["junk*".to_string()];

    let context = indexer.ensure_index(&config).await.unwrap();
    assert_eq!(context.stats.total_files, 2);
    let manifest = store.manifest(&context.rag_id).await.unwrap();
    let paths: Vec<&str> = manifest.iter().map(|e| e.rel_path.as_str()).collect();
    assert!(paths.contains(&"code.rs"));
    assert!(paths.contains(&"notes.md"));
    assert!(!paths.contains(&"junk.log"));
}

#[tokio::test]
async fn embedding_dimension_drift_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.txt", &"alpha line.\n".repeat(20));

    let store: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
    let indexer = RagIndexer::new(Arc::clone(&store), StaticEmbedder::with_dim(8));
    let config = config_for(dir.path());
    indexer.ensure_index(&config).await.unwrap();

    // Same settings, new embedder with a different dimension behind the
    // same store: the index must refuse to mix.
    write_file(dir.path(), "a.txt", &"changed alpha line.\n".repeat(20));
    let drifted = RagIndexer::new(Arc::clone(&store), StaticEmbedder::with_dim(16));
    let err = drifted.ensure_index(&config).await.unwrap_err();
    assert!(err.to_string().contains("dimension mismatch"), "got: {err}");
}

#[tokio::test]
async fn query_returns_relevant_chunks() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "animals.txt",
        "The quick brown fox jumps over the lazy dog.\n\nCats sleep most of the day away.\n",
    );
    let h = harness(ScriptedChat::constant("unused"));
    let indexer = RagIndexer::new(Arc::clone(&h.services.chunks), h.embedder.clone());
    let mut config = config_for(dir.path());
    config.chunk_chars = 50;
    let context = indexer.ensure_index(&config).await.unwrap();

    let hits = indexer.query(&context, "quick brown fox", 2).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits[0].source.contains("animals.txt"));
    assert!(hits[0].score > 0.0);
}
