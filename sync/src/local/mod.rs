//! Local entity store contract.
//!
//! The store is a table-scoped key/value store of JSON values. Records,
//! outbox entries and pull cursors all live in it; the reserved tables are
//! [`stash_engine::OUTBOX_TABLE`] and [`stash_engine::CURSOR_TABLE`].

mod memory;
pub mod records;

pub use memory::MemoryStore;
pub use records::Txn;

use async_trait::async_trait;
use serde_json::Value;

/// Errors raised by a local store implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Local store unavailable: {0}")]
    Unavailable(String),
    #[error("Local store backend error: {0}")]
    Backend(String),
}

/// A single write inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Put {
        table: String,
        id: String,
        value: Value,
    },
    Delete {
        table: String,
        id: String,
    },
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, table: &str, id: &str) -> Result<Option<Value>, StoreError>;
    async fn put(&self, table: &str, id: &str, value: Value) -> Result<(), StoreError>;
    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError>;

    /// Fetch several rows of one table, in the order of `ids`.
    /// Default implementation falls back to sequential gets.
    async fn bulk_get(&self, table: &str, ids: &[String]) -> Result<Vec<Option<Value>>, StoreError> {
        let mut values = Vec::with_capacity(ids.len());
        for id in ids {
            values.push(self.get(table, id).await?);
        }
        Ok(values)
    }

    /// All rows of a table, ordered by id.
    async fn query(&self, table: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Apply all writes atomically: either every write lands or none does.
    async fn transact(&self, writes: Vec<StoreWrite>) -> Result<(), StoreError>;
}
