//! Mutation types for expressing local changes.
//!
//! Every local write is expressed as a mutation against exactly one entity.
//! Mutations are what the outbox queues and what a flush sends upstream.

use crate::{error::Result, EntityId, Error, MutationId, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field map carried by a mutation or a record.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// The kind of change a mutation expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    /// Create an entity (full payload)
    Insert,
    /// Change some fields of an entity (partial payload)
    Update,
    /// Remove an entity (empty payload)
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Insert => f.write_str("insert"),
            MutationKind::Update => f.write_str("update"),
            MutationKind::Delete => f.write_str("delete"),
        }
    }
}

/// Identifies one entity across tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub table: TableName,
    pub entity_id: EntityId,
}

impl EntityKey {
    pub fn new(table: impl Into<TableName>, entity_id: impl Into<EntityId>) -> Self {
        Self {
            table: table.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.entity_id)
    }
}

/// An intended change to exactly one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Client-generated mutation ID
    pub id: MutationId,
    /// Target table
    pub table: TableName,
    /// Target entity
    pub entity_id: EntityId,
    /// What kind of change this is
    #[serde(rename = "operation")]
    pub kind: MutationKind,
    /// Full for inserts, partial for updates, empty for deletes
    #[serde(default)]
    pub payload: Payload,
    /// Wall-clock creation time (milliseconds since epoch)
    pub created_at: Timestamp,
    /// Number of failed delivery attempts so far
    #[serde(default)]
    pub attempts: u32,
}

impl Mutation {
    /// Create a new mutation of any kind.
    pub fn new(
        id: impl Into<MutationId>,
        table: impl Into<TableName>,
        entity_id: impl Into<EntityId>,
        kind: MutationKind,
        payload: Payload,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            entity_id: entity_id.into(),
            kind,
            payload,
            created_at,
            attempts: 0,
        }
    }

    /// Create an insert mutation.
    pub fn insert(
        id: impl Into<MutationId>,
        table: impl Into<TableName>,
        entity_id: impl Into<EntityId>,
        payload: Payload,
        created_at: Timestamp,
    ) -> Self {
        Self::new(id, table, entity_id, MutationKind::Insert, payload, created_at)
    }

    /// Create an update mutation.
    pub fn update(
        id: impl Into<MutationId>,
        table: impl Into<TableName>,
        entity_id: impl Into<EntityId>,
        payload: Payload,
        created_at: Timestamp,
    ) -> Self {
        Self::new(id, table, entity_id, MutationKind::Update, payload, created_at)
    }

    /// Create a delete mutation.
    pub fn delete(
        id: impl Into<MutationId>,
        table: impl Into<TableName>,
        entity_id: impl Into<EntityId>,
        created_at: Timestamp,
    ) -> Self {
        Self::new(
            id,
            table,
            entity_id,
            MutationKind::Delete,
            Payload::new(),
            created_at,
        )
    }

    /// The entity this mutation targets.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.table.clone(), self.entity_id.clone())
    }

    pub fn is_delete(&self) -> bool {
        self.kind == MutationKind::Delete
    }

    /// Check the structural rules a mutation must satisfy before it is queued.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::InvalidMutation {
                id: self.id.clone(),
                reason: reason.to_string(),
            })
        };

        if self.id.is_empty() {
            return invalid("missing mutation id");
        }
        if self.table.is_empty() {
            return invalid("missing table");
        }
        if self.table.starts_with('_') {
            return invalid("table names starting with '_' are reserved");
        }
        if self.entity_id.is_empty() {
            return invalid("missing entity id");
        }
        if self.kind == MutationKind::Delete && !self.payload.is_empty() {
            return invalid("delete carries a payload");
        }
        Ok(())
    }
}

/// Convert a JSON value into a payload, rejecting anything but an object.
pub fn payload_from_value(value: serde_json::Value) -> Result<Payload> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(Payload::new()),
        other => Err(Error::InvalidPayload(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}
