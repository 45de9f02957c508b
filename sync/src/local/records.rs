//! Typed access to the local store.
//!
//! Every write of a record, an outbox entry or a cursor is staged in a
//! [`Txn`] and committed through [`LocalStore::transact`], so an optimistic
//! record update and the outbox change that goes with it land together.
//!
//! Records are stored per user, in the entity's own table.

use super::{LocalStore, StoreError, StoreWrite};
use crate::error::Result;
use serde_json::Value;
use stash_engine::{
    cursor_row_id, outbox_row_id, record_row_id, EntityId, EntityKey, Error, LocalRecord, OutboxEntry,
    PersistedCursor, PersistedEntry, TableName, UserId, CURSOR_TABLE, OUTBOX_TABLE,
};
use std::collections::HashMap;

/// A batch of writes committed atomically.
#[derive(Debug, Default)]
pub struct Txn {
    writes: Vec<StoreWrite>,
    records: Vec<EntityKey>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_record(&mut self, user_id: &str, record: &LocalRecord) -> Result<()> {
        let value = serde_json::to_value(record).map_err(|e| Error::Corrupt(e.to_string()))?;
        self.writes.push(StoreWrite::Put {
            table: record.table.clone(),
            id: record_row_id(user_id, &record.entity_id),
            value,
        });
        self.records.push(record.key());
        Ok(())
    }

    pub fn delete_record(&mut self, user_id: &str, key: &EntityKey) {
        self.writes.push(StoreWrite::Delete {
            table: key.table.clone(),
            id: record_row_id(user_id, &key.entity_id),
        });
        self.records.push(key.clone());
    }

    pub fn put_entry(&mut self, user_id: &str, entry: &OutboxEntry) -> Result<()> {
        let persisted = PersistedEntry::new(user_id, entry.clone());
        self.writes.push(StoreWrite::Put {
            table: OUTBOX_TABLE.to_string(),
            id: persisted.row_id(),
            value: persisted.to_value()?,
        });
        Ok(())
    }

    pub fn delete_entry(&mut self, user_id: &str, key: &EntityKey) {
        self.writes.push(StoreWrite::Delete {
            table: OUTBOX_TABLE.to_string(),
            id: outbox_row_id(user_id, &key.table, &key.entity_id),
        });
    }

    pub fn put_cursor(&mut self, user_id: &str, table: &TableName, cursor: u64) -> Result<()> {
        let value = serde_json::to_value(PersistedCursor::new(cursor))
            .map_err(|e| Error::Corrupt(e.to_string()))?;
        self.writes.push(StoreWrite::Put {
            table: CURSOR_TABLE.to_string(),
            id: cursor_row_id(user_id, table),
            value,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Commit all staged writes. Returns the record keys that changed.
    pub async fn commit(self, store: &dyn LocalStore) -> std::result::Result<Vec<EntityKey>, StoreError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        store.transact(self.writes).await?;

        let mut keys = self.records;
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn decode_record(value: Value) -> Result<LocalRecord> {
    Ok(serde_json::from_value(value).map_err(|e| Error::Corrupt(e.to_string()))?)
}

/// Load a user's copy of one record, tombstoned or not.
pub async fn load_record(
    store: &dyn LocalStore,
    user_id: &str,
    key: &EntityKey,
) -> Result<Option<LocalRecord>> {
    store
        .get(&key.table, &record_row_id(user_id, &key.entity_id))
        .await?
        .map(decode_record)
        .transpose()
}

/// Load a user's copies of several records of one table, in the order of `ids`.
pub async fn load_records(
    store: &dyn LocalStore,
    user_id: &str,
    table: &str,
    ids: &[EntityId],
) -> Result<Vec<Option<LocalRecord>>> {
    let rows: Vec<String> = ids.iter().map(|id| record_row_id(user_id, id)).collect();
    store
        .bulk_get(table, &rows)
        .await?
        .into_iter()
        .map(|value| value.map(decode_record).transpose())
        .collect()
}

/// Load the pull cursor for a table, starting at zero.
pub async fn load_cursor(store: &dyn LocalStore, user_id: &str, table: &TableName) -> Result<u64> {
    match store.get(CURSOR_TABLE, &cursor_row_id(user_id, table)).await? {
        Some(value) => {
            let cursor: PersistedCursor =
                serde_json::from_value(value).map_err(|e| Error::Corrupt(e.to_string()))?;
            Ok(cursor.cursor)
        }
        None => Ok(0),
    }
}

/// Load every persisted outbox entry, grouped by owner.
pub async fn load_outboxes(store: &dyn LocalStore) -> Result<HashMap<UserId, Vec<OutboxEntry>>> {
    let mut outboxes: HashMap<UserId, Vec<OutboxEntry>> = HashMap::new();
    for (_, value) in store.query(OUTBOX_TABLE).await? {
        let persisted = PersistedEntry::from_value(value)?;
        outboxes
            .entry(persisted.user_id)
            .or_default()
            .push(persisted.entry);
    }
    Ok(outboxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryStore;
    use serde_json::json;
    use stash_engine::{payload_from_value, Mutation, Outbox};

    fn record(id: &str) -> LocalRecord {
        LocalRecord::new_local("events", id, payload_from_value(json!({"title": id})).unwrap(), 1)
    }

    #[tokio::test]
    async fn test_record_and_entry_commit_together() {
        let store = MemoryStore::new();
        let mut outbox = Outbox::new();
        outbox.append(Mutation::insert("m-1", "events", "1", Default::default(), 1), false);

        let mut txn = Txn::new();
        txn.put_record("alice", &record("1")).unwrap();
        for entry in outbox.entries() {
            txn.put_entry("alice", entry).unwrap();
        }
        let keys = txn.commit(&store).await.unwrap();

        assert_eq!(keys, vec![EntityKey::new("events", "1")]);
        assert_eq!(store.commits(), 1);

        let key = EntityKey::new("events", "1");
        let loaded = load_record(&store, "alice", &key).await.unwrap();
        assert_eq!(loaded, Some(record("1")));
        assert_eq!(load_record(&store, "bob", &key).await.unwrap(), None);

        let outboxes = load_outboxes(&store).await.unwrap();
        assert_eq!(outboxes["alice"].len(), 1);
        assert_eq!(outboxes["alice"][0].mutation.id, "m-1");
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_store_untouched() {
        let store = MemoryStore::new();
        store.fail_writes(true);

        let mut txn = Txn::new();
        txn.put_record("alice", &record("1")).unwrap();
        assert!(txn.commit(&store).await.is_err());

        store.fail_writes(false);
        let key = EntityKey::new("events", "1");
        assert_eq!(load_record(&store, "alice", &key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_txn_is_not_committed() {
        let store = MemoryStore::new();
        let txn = Txn::new();
        assert!(txn.is_empty());
        let keys = txn.commit(&store).await.unwrap();
        assert!(keys.is_empty());
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn test_cursor_defaults_to_zero() {
        let store = MemoryStore::new();
        let table = "events".to_string();
        assert_eq!(load_cursor(&store, "alice", &table).await.unwrap(), 0);

        let mut txn = Txn::new();
        txn.put_cursor("alice", &table, 42).unwrap();
        txn.commit(&store).await.unwrap();

        assert_eq!(load_cursor(&store, "alice", &table).await.unwrap(), 42);
        assert_eq!(load_cursor(&store, "bob", &table).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_load_preserves_order() {
        let store = MemoryStore::new();
        let mut txn = Txn::new();
        txn.put_record("alice", &record("a")).unwrap();
        txn.put_record("alice", &record("c")).unwrap();
        txn.put_record("bob", &record("b")).unwrap();
        txn.commit(&store).await.unwrap();

        let ids = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        let loaded = load_records(&store, "alice", "events", &ids).await.unwrap();
        assert_eq!(loaded[0].as_ref().map(|r| r.entity_id.as_str()), Some("c"));
        assert!(loaded[1].is_none());
        assert_eq!(loaded[2].as_ref().map(|r| r.entity_id.as_str()), Some("a"));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_reported() {
        let store = MemoryStore::new();
        store.put(OUTBOX_TABLE, "x", json!({"nope": true})).await.unwrap();

        let err = load_outboxes(&store).await.unwrap_err();
        assert!(matches!(err, crate::SyncError::Engine(Error::Corrupt(_))));
    }
}
