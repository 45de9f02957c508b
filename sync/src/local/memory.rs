use super::{LocalStore, StoreError, StoreWrite};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

type Tables = HashMap<String, BTreeMap<String, Value>>;

/// In-memory local store.
///
/// Transactions take a single write lock, so they are atomic with respect to
/// every other call. Writes can be made to fail for testing.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
    commits: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful write calls (puts, deletes and transactions).
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of rows in a table.
    pub async fn len(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, BTreeMap::len)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }

    fn apply(tables: &mut Tables, write: StoreWrite) {
        match write {
            StoreWrite::Put { table, id, value } => {
                tables.entry(table).or_default().insert(id, value);
            }
            StoreWrite::Delete { table, id } => {
                if let Some(rows) = tables.get_mut(&table) {
                    rows.remove(&id);
                }
            }
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, table: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn put(&self, table: &str, id: &str, value: Value) -> Result<(), StoreError> {
        self.transact(vec![StoreWrite::Put {
            table: table.to_string(),
            id: id.to_string(),
            value,
        }])
        .await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        self.transact(vec![StoreWrite::Delete {
            table: table.to_string(),
            id: id.to_string(),
        }])
        .await
    }

    async fn bulk_get(&self, table: &str, ids: &[String]) -> Result<Vec<Option<Value>>, StoreError> {
        let tables = self.tables.read().await;
        let rows = tables.get(table);
        Ok(ids
            .iter()
            .map(|id| rows.and_then(|rows| rows.get(id)).cloned())
            .collect())
    }

    async fn query(&self, table: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().map(|(id, v)| (id.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn transact(&self, writes: Vec<StoreWrite>) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        for write in writes {
            Self::apply(&mut tables, write);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put(table: &str, id: &str, value: Value) -> StoreWrite {
        StoreWrite::Put {
            table: table.into(),
            id: id.into(),
            value,
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("events", "1", json!({"title": "A"})).await.unwrap();

        assert_eq!(
            store.get("events", "1").await.unwrap(),
            Some(json!({"title": "A"}))
        );
        assert_eq!(store.get("calendars", "1").await.unwrap(), None);

        store.delete("events", "1").await.unwrap();
        assert_eq!(store.get("events", "1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transact_spans_tables() {
        let store = MemoryStore::new();
        store
            .transact(vec![
                put("events", "1", json!({"title": "A"})),
                put("_outbox", "alice:1", json!({"seq": 0})),
            ])
            .await
            .unwrap();

        assert_eq!(store.len("events").await, 1);
        assert_eq!(store.len("_outbox").await, 1);
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn test_failed_transaction_writes_nothing() {
        let store = MemoryStore::new();
        store.fail_writes(true);

        let result = store
            .transact(vec![put("events", "1", json!({})), put("events", "2", json!({}))])
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.len("events").await, 0);
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn test_bulk_get_and_query_order() {
        let store = MemoryStore::new();
        for id in ["b", "a", "c"] {
            store.put("events", id, json!({ "id": id })).await.unwrap();
        }

        let ids: Vec<String> = vec!["c".into(), "x".into(), "a".into()];
        let values = store.bulk_get("events", &ids).await.unwrap();
        assert_eq!(values, vec![Some(json!({"id": "c"})), None, Some(json!({"id": "a"}))]);

        let rows = store.query("events").await.unwrap();
        let ids: Vec<_> = rows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
