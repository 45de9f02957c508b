//! Pull synchronizer - cursor-based download of remote changes.
//!
//! Pages of changes are applied to local records unless the entity is dirty,
//! in which case the incoming version is staged until the pending mutation
//! settles. A remote delete always wins over a pending local change.

use crate::engine::{now_millis, Context};
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::local::{records, Txn};
use crate::remote::ChangeSet;
use crate::session::{UserQueue, UserSession};
use stash_engine::{
    EntityId, EntityKey, LocalRecord, MutationId, MutationKind, TableName, Timestamp, Version,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::slice;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one pull.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullResult {
    /// Remote versions written to clean local records
    pub applied: usize,
    /// Local records removed by remote tombstones
    pub removed: usize,
    /// Remote versions held back because the entity is dirty
    pub staged: usize,
    /// Pending changes discarded by remote deletes
    pub conflicts: Vec<Conflict>,
    /// Cursor per pulled table after the pull
    pub cursors: BTreeMap<TableName, u64>,
}

/// A pending local change lost to a remote delete.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub key: EntityKey,
    pub dropped_mutation: MutationId,
    pub remote_version: Version,
}

impl From<&Conflict> for SyncError {
    fn from(conflict: &Conflict) -> Self {
        SyncError::ConflictDetected {
            key: conflict.key.to_string(),
            detail: format!(
                "deleted remotely at version {}, dropped pending mutation {}",
                conflict.remote_version, conflict.dropped_mutation
            ),
        }
    }
}

/// Apply the staged remote version of a record whose mutation has settled.
/// Versions not newer than the record's are discarded.
pub(crate) fn settle_staged(queue: &mut UserQueue, record: &mut LocalRecord, now: Timestamp) -> bool {
    match queue.staged.remove(&record.key()) {
        Some(remote) => record.apply_remote(&remote, now),
        None => false,
    }
}

#[derive(Clone)]
pub(crate) struct PullSynchronizer {
    ctx: Arc<Context>,
}

impl PullSynchronizer {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Pull one table, or every configured table.
    pub async fn pull_now(&self, user_id: &str, table: Option<&str>) -> Result<PullResult> {
        let session = self.ctx.sessions.get_or_create(user_id);
        let tables: Vec<TableName> = match table {
            Some(table) => vec![table.to_string()],
            None => self.ctx.config.tables.clone(),
        };

        let mut result = PullResult::default();
        for table in &tables {
            let cursor = self.pull_table(&session, table, &mut result).await?;
            result.cursors.insert(table.clone(), cursor);
        }
        Ok(result)
    }

    async fn pull_table(
        &self,
        session: &UserSession,
        table: &TableName,
        result: &mut PullResult,
    ) -> Result<u64> {
        let user_id = session.user_id.as_str();
        let mut cursor = records::load_cursor(self.ctx.store.as_ref(), user_id, table).await?;
        let (applied_before, staged_before) = (result.applied, result.staged);

        loop {
            let page = self
                .ctx
                .remote
                .changes_since(user_id, table, cursor, self.ctx.config.pull_page_size)
                .await?;
            debug!(
                user_id = %user_id,
                table = %table,
                cursor,
                records = page.records.len(),
                has_more = page.has_more,
                "pulled page"
            );

            let previous = cursor;
            cursor = self.apply_page(session, table, cursor, &page, result).await?;
            if !page.has_more || page.records.is_empty() {
                break;
            }
            if cursor <= previous {
                warn!(user_id = %user_id, table = %table, cursor, "cursor did not advance, stopping pull");
                break;
            }
        }

        let (applied, staged) = (result.applied - applied_before, result.staged - staged_before);
        info!(user_id = %user_id, table = %table, applied, staged, cursor, "pull completed");
        self.ctx.events.emit(SyncEvent::PullCompleted {
            user_id: user_id.to_string(),
            table: table.clone(),
            applied,
            staged,
        });
        Ok(cursor)
    }

    /// Apply one page and advance the cursor in a single transaction.
    async fn apply_page(
        &self,
        session: &UserSession,
        table: &TableName,
        cursor: u64,
        page: &ChangeSet,
        result: &mut PullResult,
    ) -> Result<u64> {
        let user_id = session.user_id.as_str();
        let now = now_millis();

        let mut queue = session.queue.lock().await;
        let mut next = queue.clone();
        let mut txn = Txn::new();

        let ids: Vec<EntityId> = page.records.iter().map(|r| r.entity_id.clone()).collect();
        let loaded = records::load_records(self.ctx.store.as_ref(), user_id, table, &ids).await?;
        let mut local: HashMap<EntityId, Option<LocalRecord>> = HashMap::new();
        for (id, record) in ids.into_iter().zip(loaded) {
            local.entry(id).or_insert(record);
        }

        let mut changed: BTreeSet<EntityId> = BTreeSet::new();
        let mut conflicts = Vec::new();

        for remote in page.records.iter().filter(|r| r.table == *table) {
            let key = remote.key();
            let slot = local.entry(remote.entity_id.clone()).or_insert(None);
            let pending = next
                .outbox
                .entry(&key)
                .map(|entry| (entry.mutation.id.clone(), entry.mutation.kind));

            match pending {
                Some((mutation_id, MutationKind::Delete)) if remote.deleted => {
                    // Both sides deleted; a deferred re-insert becomes a new entity
                    let removal = next.outbox.remove(slice::from_ref(&mutation_id)).pop();
                    match removal.and_then(|r| r.promoted) {
                        Some(entry) => {
                            txn.put_entry(user_id, &entry)?;
                            if let Some(record) = slot.as_mut() {
                                record.server_version = None;
                                record.dirty = true;
                            }
                        }
                        None => {
                            txn.delete_entry(user_id, &key);
                            *slot = None;
                            result.removed += 1;
                        }
                    }
                    next.staged.remove(&key);
                    changed.insert(remote.entity_id.clone());
                }
                Some((mutation_id, _)) if remote.deleted => {
                    next.outbox.drop_entity(&key);
                    next.staged.remove(&key);
                    txn.delete_entry(user_id, &key);
                    *slot = None;
                    changed.insert(remote.entity_id.clone());
                    result.removed += 1;

                    warn!(
                        user_id = %user_id,
                        key = %key,
                        mutation_id = %mutation_id,
                        version = remote.version,
                        "remote delete discarded pending change"
                    );
                    conflicts.push(Conflict {
                        key,
                        dropped_mutation: mutation_id,
                        remote_version: remote.version,
                    });
                }
                Some(_) => {
                    next.stage(remote.clone());
                    result.staged += 1;
                }
                None if remote.deleted => {
                    next.staged.remove(&key);
                    if slot.take().is_some() {
                        changed.insert(remote.entity_id.clone());
                        result.removed += 1;
                    }
                }
                None => {
                    let applied = match slot {
                        Some(record) => record.apply_remote(remote, now),
                        None => {
                            *slot = Some(LocalRecord::from_remote(remote, now));
                            true
                        }
                    };
                    if applied {
                        changed.insert(remote.entity_id.clone());
                        result.applied += 1;
                    }
                }
            }
        }

        for id in &changed {
            match local.get(id) {
                Some(Some(record)) => txn.put_record(user_id, record)?,
                _ => txn.delete_record(user_id, &EntityKey::new(table.clone(), id.clone())),
            }
        }

        let cursor = page.next_cursor.max(cursor);
        txn.put_cursor(user_id, table, cursor)?;
        self.ctx.commit(user_id, txn).await?;

        *queue = next;
        session.set_pending(queue.outbox.count());
        drop(queue);

        for conflict in &conflicts {
            self.ctx.events.emit(SyncEvent::ConflictDetected {
                user_id: user_id.to_string(),
                key: conflict.key.clone(),
                mutation_id: conflict.dropped_mutation.clone(),
            });
        }
        result.conflicts.extend(conflicts);

        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stash_engine::{payload_from_value, RemoteRecord};

    fn record(version: Option<Version>) -> LocalRecord {
        let mut record = LocalRecord::new_local(
            "events",
            "1",
            payload_from_value(json!({"title": "local"})).unwrap(),
            1,
        );
        record.server_version = version;
        record
    }

    fn remote(version: Version) -> RemoteRecord {
        RemoteRecord::new(
            "events",
            "1",
            payload_from_value(json!({"title": "remote"})).unwrap(),
            version,
        )
    }

    #[test]
    fn test_staged_version_newer_than_ack_is_applied() {
        let mut queue = UserQueue::default();
        queue.stage(remote(7));
        let mut record = record(Some(5));

        assert!(settle_staged(&mut queue, &mut record, 10));
        assert_eq!(record.fields["title"], json!("remote"));
        assert_eq!(record.server_version, Some(7));
        assert!(queue.staged.is_empty());
    }

    #[test]
    fn test_staged_version_older_than_ack_is_dropped() {
        let mut queue = UserQueue::default();
        queue.stage(remote(4));
        let mut record = record(Some(6));

        assert!(!settle_staged(&mut queue, &mut record, 10));
        assert_eq!(record.fields["title"], json!("local"));
        assert!(queue.staged.is_empty());
    }

    #[test]
    fn test_conflict_error() {
        let conflict = Conflict {
            key: EntityKey::new("events", "1"),
            dropped_mutation: "m-1".into(),
            remote_version: 9,
        };
        let err = SyncError::from(&conflict);
        assert!(matches!(err, SyncError::ConflictDetected { .. }));
        assert!(err.to_string().contains("events/1"));
    }
}
