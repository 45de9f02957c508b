use super::{
    group_by_table, ChangeSet, DeleteRequest, MutationOutcome, RemoteBackend, RemoteError,
    UpsertRequest,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use stash_engine::{
    EntityId, EntityKey, Mutation, MutationId, Payload, RemoteRecord, Timestamp, UserId, Version,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct StoredRecord {
    fields: Payload,
    /// Write time of each field, for last-writer-wins across clients
    field_times: HashMap<String, Timestamp>,
    version: Version,
    deleted: bool,
}

#[derive(Debug, Default)]
struct UserData {
    records: HashMap<EntityKey, StoredRecord>,
    /// Outcome per processed mutation id; replays return the stored outcome
    outcomes: HashMap<MutationId, MutationOutcome>,
}

#[derive(Debug, Default)]
struct BackendState {
    users: HashMap<UserId, UserData>,
    clock: Version,
    rejections: HashMap<EntityId, String>,
    withheld: HashSet<EntityId>,
}

impl BackendState {
    fn apply_upsert(&mut self, user_id: &str, table: &str, req: &UpsertRequest) -> Option<MutationOutcome> {
        if self.withheld.contains(&req.entity_id) {
            return None;
        }
        let data = self.users.entry(user_id.to_string()).or_default();
        if let Some(outcome) = data.outcomes.get(&req.mutation_id) {
            return Some(outcome.clone());
        }

        let key = EntityKey::new(table, req.entity_id.clone());
        let outcome = if let Some(reason) = self.rejections.get(&req.entity_id) {
            MutationOutcome::Rejected {
                mutation_id: req.mutation_id.clone(),
                reason: reason.clone(),
            }
        } else if !req.create && data.records.get(&key).is_some_and(|r| r.deleted) {
            MutationOutcome::Rejected {
                mutation_id: req.mutation_id.clone(),
                reason: "entity was deleted".into(),
            }
        } else {
            self.clock += 1;
            let record = data.records.entry(key).or_default();
            if record.deleted {
                *record = StoredRecord::default();
            }
            for (field, value) in &req.fields {
                let written_at = record.field_times.get(field).copied().unwrap_or(0);
                if req.created_at >= written_at {
                    record.fields.insert(field.clone(), value.clone());
                    record.field_times.insert(field.clone(), req.created_at);
                }
            }
            record.version = self.clock;
            MutationOutcome::Applied {
                mutation_id: req.mutation_id.clone(),
                server_version: self.clock,
            }
        };

        data.outcomes.insert(req.mutation_id.clone(), outcome.clone());
        Some(outcome)
    }

    fn apply_delete(&mut self, user_id: &str, table: &str, req: &DeleteRequest) -> Option<MutationOutcome> {
        if self.withheld.contains(&req.entity_id) {
            return None;
        }
        let data = self.users.entry(user_id.to_string()).or_default();
        if let Some(outcome) = data.outcomes.get(&req.mutation_id) {
            return Some(outcome.clone());
        }

        let outcome = if let Some(reason) = self.rejections.get(&req.entity_id) {
            MutationOutcome::Rejected {
                mutation_id: req.mutation_id.clone(),
                reason: reason.clone(),
            }
        } else {
            self.clock += 1;
            let record = data
                .records
                .entry(EntityKey::new(table, req.entity_id.clone()))
                .or_default();
            *record = StoredRecord {
                version: self.clock,
                deleted: true,
                ..Default::default()
            };
            MutationOutcome::Applied {
                mutation_id: req.mutation_id.clone(),
                server_version: self.clock,
            }
        };

        data.outcomes.insert(req.mutation_id.clone(), outcome.clone());
        Some(outcome)
    }

    fn apply_batch(&mut self, user_id: &str, mutations: &[Mutation]) -> Vec<MutationOutcome> {
        let mut outcomes = Vec::with_capacity(mutations.len());
        for batch in group_by_table(mutations) {
            for req in &batch.upserts {
                outcomes.extend(self.apply_upsert(user_id, &batch.table, req));
            }
            for req in &batch.deletes {
                outcomes.extend(self.apply_delete(user_id, &batch.table, req));
            }
        }
        outcomes
    }

    fn record(&self, user_id: &str, key: &EntityKey) -> Option<RemoteRecord> {
        let stored = self.users.get(user_id)?.records.get(key)?;
        Some(to_remote(key, stored))
    }
}

fn to_remote(key: &EntityKey, stored: &StoredRecord) -> RemoteRecord {
    if stored.deleted {
        RemoteRecord::tombstone(key.table.clone(), key.entity_id.clone(), stored.version)
    } else {
        RemoteRecord::new(
            key.table.clone(),
            key.entity_id.clone(),
            stored.fields.clone(),
            stored.version,
        )
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory reference backend.
///
/// Processes mutations idempotently by mutation id, merges upserts per field
/// with last-writer-wins on the mutation timestamp, keeps tombstones, and
/// versions every change from one monotonic clock that doubles as the pull
/// cursor. Failures, rejections and latency can be injected for testing.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: tokio::sync::Mutex<BackendState>,
    latency: Mutex<Option<Duration>>,
    offline: AtomicBool,
    fail_next: AtomicUsize,
    lose_next: AtomicUsize,
    push_calls: AtomicUsize,
    pull_calls: AtomicUsize,
    received: AtomicUsize,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every push by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Fail every call with a transient error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` pushes with a transient error before applying anything.
    pub fn fail_next_pushes(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` pushes, then fail them as if the response was lost.
    pub fn lose_next_responses(&self, n: usize) {
        self.lose_next.store(n, Ordering::SeqCst);
    }

    /// Reject every mutation of this entity with `reason`.
    pub async fn reject_entity(&self, entity_id: &str, reason: &str) {
        self.state
            .lock()
            .await
            .rejections
            .insert(entity_id.to_string(), reason.to_string());
    }

    /// Leave mutations of this entity unprocessed and without an outcome.
    pub async fn withhold(&self, entity_id: &str) {
        self.state.lock().await.withheld.insert(entity_id.to_string());
    }

    pub async fn release(&self, entity_id: &str) {
        self.state.lock().await.withheld.remove(entity_id);
    }

    /// Number of push_batch calls received.
    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Number of changes_since calls received.
    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    /// Total mutations received across all pushes, replays included.
    pub fn received_mutations(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Number of distinct mutation ids processed for a user.
    pub async fn processed_mutations(&self, user_id: &str) -> usize {
        self.state
            .lock()
            .await
            .users
            .get(user_id)
            .map_or(0, |data| data.outcomes.len())
    }

    /// Current server copy of a record, tombstones included.
    pub async fn record(&self, user_id: &str, table: &str, entity_id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .await
            .record(user_id, &EntityKey::new(table, entity_id))
    }

    /// Write fields as another client would. Returns the new version.
    pub async fn write_remote(
        &self,
        user_id: &str,
        table: &str,
        entity_id: &str,
        fields: Payload,
        created_at: Timestamp,
    ) -> Version {
        let req = UpsertRequest {
            mutation_id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.to_string(),
            fields,
            create: true,
            created_at,
        };
        let mut state = self.state.lock().await;
        state.apply_upsert(user_id, table, &req);
        state.clock
    }

    /// Delete an entity as another client would. Returns the tombstone version.
    pub async fn delete_remote(&self, user_id: &str, table: &str, entity_id: &str) -> Version {
        let req = DeleteRequest {
            mutation_id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.to_string(),
        };
        let mut state = self.state.lock().await;
        state.apply_delete(user_id, table, &req);
        state.clock
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Transient("backend offline".into()));
        }
        if take_one(&self.fail_next) {
            return Err(RemoteError::Transient("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn upsert(
        &self,
        user_id: &str,
        table: &str,
        records: &[UpsertRequest],
    ) -> Result<Vec<MutationOutcome>, RemoteError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(records
            .iter()
            .filter_map(|req| state.apply_upsert(user_id, table, req))
            .collect())
    }

    async fn delete(
        &self,
        user_id: &str,
        table: &str,
        ids: &[DeleteRequest],
    ) -> Result<Vec<MutationOutcome>, RemoteError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|req| state.apply_delete(user_id, table, req))
            .collect())
    }

    async fn changes_since(
        &self,
        user_id: &str,
        table: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<ChangeSet, RemoteError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Transient("backend offline".into()));
        }

        let state = self.state.lock().await;
        let Some(data) = state.users.get(user_id) else {
            return Ok(ChangeSet {
                records: Vec::new(),
                next_cursor: cursor,
                has_more: false,
            });
        };

        let mut records: Vec<RemoteRecord> = data
            .records
            .iter()
            .filter(|(key, stored)| key.table == table && stored.version > cursor)
            .map(|(key, stored)| to_remote(key, stored))
            .collect();
        records.sort_by_key(|r| r.version);

        let limit = limit.max(1);
        let has_more = records.len() > limit;
        records.truncate(limit);
        let next_cursor = records.last().map_or(cursor, |r| r.version);

        Ok(ChangeSet {
            records,
            next_cursor,
            has_more,
        })
    }

    async fn push_batch(
        &self,
        user_id: &str,
        mutations: &[Mutation],
    ) -> Result<Vec<MutationOutcome>, RemoteError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.received.fetch_add(mutations.len(), Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_available()?;

        let outcomes = self.state.lock().await.apply_batch(user_id, mutations);

        if take_one(&self.lose_next) {
            return Err(RemoteError::Transient("response lost".into()));
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stash_engine::payload_from_value;

    fn fields(value: serde_json::Value) -> Payload {
        payload_from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_replayed_mutation_returns_same_outcome() {
        let backend = MemoryBackend::new();
        let batch = vec![Mutation::insert("m-1", "events", "1", fields(json!({"title": "A"})), 10)];

        let first = backend.push_batch("alice", &batch).await.unwrap();
        let second = backend.push_batch("alice", &batch).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.processed_mutations("alice").await, 1);
        assert_eq!(backend.record("alice", "events", "1").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_field_level_last_writer_wins() {
        let backend = MemoryBackend::new();
        backend
            .write_remote("alice", "events", "1", fields(json!({"title": "A", "color": "red"})), 10)
            .await;

        let batch = vec![
            Mutation::update("m-2", "events", "1", fields(json!({"title": "stale"})), 5),
            Mutation::update("m-3", "events", "1", fields(json!({"color": "blue"})), 20),
        ];
        backend.push_batch("alice", &batch).await.unwrap();

        let record = backend.record("alice", "events", "1").await.unwrap();
        assert_eq!(record.fields, fields(json!({"title": "A", "color": "blue"})));
    }

    #[tokio::test]
    async fn test_update_of_deleted_entity_is_rejected() {
        let backend = MemoryBackend::new();
        backend.write_remote("alice", "events", "1", Payload::new(), 1).await;
        backend.delete_remote("alice", "events", "1").await;

        let outcomes = backend
            .push_batch("alice", &[Mutation::update("m-1", "events", "1", fields(json!({"a": 1})), 5)])
            .await
            .unwrap();

        assert!(matches!(outcomes[0], MutationOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_insert_merges_into_live_record_and_recreates_deleted_one() {
        let backend = MemoryBackend::new();
        backend
            .write_remote("alice", "events", "1", fields(json!({"title": "A", "color": "red"})), 10)
            .await;

        let insert = Mutation::insert("m-1", "events", "1", fields(json!({"title": "B"})), 20);
        backend.push_batch("alice", &[insert]).await.unwrap();
        let record = backend.record("alice", "events", "1").await.unwrap();
        assert_eq!(record.fields, fields(json!({"title": "B", "color": "red"})));

        backend.delete_remote("alice", "events", "1").await;
        let insert = Mutation::insert("m-2", "events", "1", fields(json!({"title": "C"})), 30);
        backend.push_batch("alice", &[insert]).await.unwrap();
        let record = backend.record("alice", "events", "1").await.unwrap();
        assert!(!record.deleted);
        assert_eq!(record.fields, fields(json!({"title": "C"})));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MemoryBackend::new();
        let batch = vec![Mutation::insert("m-1", "events", "1", Payload::new(), 1)];

        backend.fail_next_pushes(1);
        assert!(matches!(
            backend.push_batch("alice", &batch).await,
            Err(RemoteError::Transient(_))
        ));
        assert_eq!(backend.processed_mutations("alice").await, 0);

        backend.lose_next_responses(1);
        assert!(backend.push_batch("alice", &batch).await.is_err());
        assert_eq!(backend.processed_mutations("alice").await, 1);

        assert!(backend.push_batch("alice", &batch).await.is_ok());
        assert_eq!(backend.push_calls(), 3);
        assert_eq!(backend.received_mutations(), 3);
    }

    #[tokio::test]
    async fn test_withheld_entity_has_no_outcome() {
        let backend = MemoryBackend::new();
        backend.withhold("2").await;

        let outcomes = backend
            .push_batch(
                "alice",
                &[
                    Mutation::insert("m-1", "events", "1", Payload::new(), 1),
                    Mutation::insert("m-2", "events", "2", Payload::new(), 2),
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].mutation_id(), "m-1");
    }

    #[tokio::test]
    async fn test_changes_since_pages_in_version_order() {
        let backend = MemoryBackend::new();
        for id in ["a", "b", "c"] {
            backend.write_remote("alice", "events", id, Payload::new(), 1).await;
        }
        backend.write_remote("alice", "calendars", "x", Payload::new(), 1).await;
        backend.delete_remote("alice", "events", "a").await;

        let page = backend.changes_since("alice", "events", 0, 2).await.unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(page.has_more);

        let page = backend
            .changes_since("alice", "events", page.next_cursor, 2)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.records[0].deleted);
        assert!(!page.has_more);

        let empty = backend.changes_since("bob", "events", 0, 2).await.unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.next_cursor, 0);
    }
}
