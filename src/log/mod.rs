//! Append-only session logging: the wide row schema and its stores.

mod row;
#[cfg(feature = "sqlite")]
mod sqlite;
mod store;

pub use row::LogRow;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLogStore;
pub use store::{CostPatch, InMemoryLogStore, LogStore, LogStoreError};
