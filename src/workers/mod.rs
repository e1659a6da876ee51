//! Long-lived background workers beyond the cost tracker.

mod embedding;

pub use embedding::EmbeddingWorker;
