//! Remote backend contract.
//!
//! The backend is the server side of sync: it accepts upserts and deletes
//! keyed by client-generated mutation ids and serves changes since a cursor.

mod memory;

pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stash_engine::{
    EntityId, Mutation, MutationId, MutationKind, Payload, RemoteRecord, TableName, Timestamp,
    Version,
};

/// Errors raised by a remote backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    /// Network or availability problem; the call may succeed later
    #[error("Transient remote failure: {0}")]
    Transient(String),
    /// The call will not succeed as sent
    #[error("Fatal remote failure: {0}")]
    Fatal(String),
}

/// Per-mutation result of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum MutationOutcome {
    #[serde(rename_all = "camelCase")]
    Applied {
        mutation_id: MutationId,
        server_version: Version,
    },
    #[serde(rename_all = "camelCase")]
    Rejected {
        mutation_id: MutationId,
        reason: String,
    },
}

impl MutationOutcome {
    pub fn mutation_id(&self) -> &MutationId {
        match self {
            MutationOutcome::Applied { mutation_id, .. }
            | MutationOutcome::Rejected { mutation_id, .. } => mutation_id,
        }
    }
}

/// One page of changes for a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub records: Vec<RemoteRecord>,
    pub next_cursor: u64,
    pub has_more: bool,
}

/// An insert or update sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest {
    pub mutation_id: MutationId,
    pub entity_id: EntityId,
    pub fields: Payload,
    /// Set for inserts, which may recreate a deleted record. Updates of a
    /// deleted record are refused. Either way, fields merge into the stored
    /// record last-writer-wins on `created_at`.
    pub create: bool,
    pub created_at: Timestamp,
}

/// A delete sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub mutation_id: MutationId,
    pub entity_id: EntityId,
}

/// The mutations of one batch that target one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableBatch {
    pub table: TableName,
    pub upserts: Vec<UpsertRequest>,
    pub deletes: Vec<DeleteRequest>,
}

/// Split a batch by table, keeping first-appearance order of tables and
/// batch order within each table.
pub fn group_by_table(mutations: &[Mutation]) -> Vec<TableBatch> {
    let mut batches: Vec<TableBatch> = Vec::new();
    for mutation in mutations {
        let index = match batches.iter().position(|b| b.table == mutation.table) {
            Some(index) => index,
            None => {
                batches.push(TableBatch {
                    table: mutation.table.clone(),
                    ..Default::default()
                });
                batches.len() - 1
            }
        };
        let batch = &mut batches[index];

        match mutation.kind {
            MutationKind::Delete => batch.deletes.push(DeleteRequest {
                mutation_id: mutation.id.clone(),
                entity_id: mutation.entity_id.clone(),
            }),
            MutationKind::Insert | MutationKind::Update => batch.upserts.push(UpsertRequest {
                mutation_id: mutation.id.clone(),
                entity_id: mutation.entity_id.clone(),
                fields: mutation.payload.clone(),
                create: mutation.kind == MutationKind::Insert,
                created_at: mutation.created_at,
            }),
        }
    }
    batches
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Apply inserts and updates. Idempotent by mutation id.
    async fn upsert(
        &self,
        user_id: &str,
        table: &str,
        records: &[UpsertRequest],
    ) -> Result<Vec<MutationOutcome>, RemoteError>;

    /// Apply deletes. Idempotent by mutation id.
    async fn delete(
        &self,
        user_id: &str,
        table: &str,
        ids: &[DeleteRequest],
    ) -> Result<Vec<MutationOutcome>, RemoteError>;

    /// Records of `table` changed after `cursor`, oldest first, at most `limit`.
    async fn changes_since(
        &self,
        user_id: &str,
        table: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<ChangeSet, RemoteError>;

    /// Push one batch and report an outcome per mutation. Mutations without
    /// an outcome were not processed.
    /// Default implementation groups by table and calls `upsert`/`delete`.
    async fn push_batch(
        &self,
        user_id: &str,
        mutations: &[Mutation],
    ) -> Result<Vec<MutationOutcome>, RemoteError> {
        let mut outcomes = Vec::with_capacity(mutations.len());
        for batch in group_by_table(mutations) {
            if !batch.upserts.is_empty() {
                outcomes.extend(self.upsert(user_id, &batch.table, &batch.upserts).await?);
            }
            if !batch.deletes.is_empty() {
                outcomes.extend(self.delete(user_id, &batch.table, &batch.deletes).await?);
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stash_engine::payload_from_value;

    #[test]
    fn test_group_by_table() {
        let fields = payload_from_value(json!({"title": "A"})).unwrap();
        let batches = group_by_table(&[
            Mutation::insert("m-1", "events", "1", fields.clone(), 1),
            Mutation::delete("m-2", "calendars", "c", 2),
            Mutation::update("m-3", "events", "2", fields, 3),
            Mutation::delete("m-4", "events", "3", 4),
        ]);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].table, "events");
        assert_eq!(batches[0].upserts.len(), 2);
        assert!(batches[0].upserts[0].create);
        assert!(!batches[0].upserts[1].create);
        assert_eq!(batches[0].deletes[0].mutation_id, "m-4");
        assert_eq!(batches[1].table, "calendars");
        assert_eq!(batches[1].deletes.len(), 1);
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome = MutationOutcome::Applied {
            mutation_id: "m-1".into(),
            server_version: 7,
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"status": "applied", "mutationId": "m-1", "serverVersion": 7})
        );
        assert_eq!(outcome.mutation_id(), "m-1");
    }
}
