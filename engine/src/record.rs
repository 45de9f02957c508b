//! Record types for local and remote state.

use crate::{EntityId, EntityKey, Mutation, MutationKind, Payload, TableName, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// The optimistic local copy of an entity plus its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    /// Table this record belongs to
    pub table: TableName,
    /// Entity identifier
    pub entity_id: EntityId,
    /// Current field values
    pub fields: Payload,
    /// Last server version this record is known to reflect
    pub server_version: Option<Version>,
    /// When the record was last changed (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// True while an outbox entry exists for this entity
    pub dirty: bool,
    /// Local tombstone set by an optimistic delete
    #[serde(default)]
    pub deleted: bool,
    /// Fields may differ from `server_version` after a rejected change; the
    /// next pulled copy at that version or later replaces them
    #[serde(default)]
    pub needs_refresh: bool,
}

impl LocalRecord {
    /// Create a record from a local write that has not reached the server.
    pub fn new_local(
        table: impl Into<TableName>,
        entity_id: impl Into<EntityId>,
        fields: Payload,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            table: table.into(),
            entity_id: entity_id.into(),
            fields,
            server_version: None,
            updated_at: timestamp,
            dirty: true,
            deleted: false,
            needs_refresh: false,
        }
    }

    /// Create a clean record from a pulled remote version.
    pub fn from_remote(remote: &RemoteRecord, timestamp: Timestamp) -> Self {
        Self {
            table: remote.table.clone(),
            entity_id: remote.entity_id.clone(),
            fields: remote.fields.clone(),
            server_version: Some(remote.version),
            updated_at: timestamp,
            dirty: false,
            deleted: false,
            needs_refresh: false,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.table.clone(), self.entity_id.clone())
    }

    /// Check if record is visible (not tombstoned).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Whether the server has acknowledged this entity at least once.
    pub fn exists_remotely(&self) -> bool {
        self.server_version.is_some()
    }

    /// Apply a local mutation optimistically.
    pub fn apply_local(&mut self, mutation: &Mutation) {
        match mutation.kind {
            MutationKind::Insert => {
                self.fields = mutation.payload.clone();
                self.deleted = false;
            }
            MutationKind::Update => {
                for (field, value) in &mutation.payload {
                    self.fields.insert(field.clone(), value.clone());
                }
            }
            MutationKind::Delete => self.deleted = true,
        }
        self.updated_at = self.updated_at.max(mutation.created_at);
    }

    /// Apply a pulled remote version.
    ///
    /// Returns false when the remote version is not newer than what the
    /// record already reflects, which makes re-applying a page a no-op. A
    /// record waiting for a refresh also takes the version it already has.
    pub fn apply_remote(&mut self, remote: &RemoteRecord, timestamp: Timestamp) -> bool {
        match self.server_version {
            Some(v) if v > remote.version => return false,
            Some(v) if v == remote.version && !self.needs_refresh => return false,
            _ => {}
        }
        self.fields = remote.fields.clone();
        self.server_version = Some(remote.version);
        self.updated_at = timestamp;
        self.deleted = false;
        self.needs_refresh = false;
        true
    }

    /// Record that the server acknowledged a version of this entity.
    pub fn acknowledge(&mut self, version: Version) {
        self.server_version = Some(self.server_version.map_or(version, |v| v.max(version)));
    }
}

/// A record as reported by the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub table: TableName,
    pub entity_id: EntityId,
    #[serde(default)]
    pub fields: Payload,
    /// Monotonic server version of this record
    pub version: Version,
    /// Tombstone marker
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteRecord {
    /// Create a live remote record.
    pub fn new(
        table: impl Into<TableName>,
        entity_id: impl Into<EntityId>,
        fields: Payload,
        version: Version,
    ) -> Self {
        Self {
            table: table.into(),
            entity_id: entity_id.into(),
            fields,
            version,
            deleted: false,
        }
    }

    /// Create a tombstone.
    pub fn tombstone(
        table: impl Into<TableName>,
        entity_id: impl Into<EntityId>,
        version: Version,
    ) -> Self {
        Self {
            table: table.into(),
            entity_id: entity_id.into(),
            fields: Payload::new(),
            version,
            deleted: true,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.table.clone(), self.entity_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload_from_value;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Payload {
        payload_from_value(value).unwrap()
    }

    #[test]
    fn local_record_starts_dirty() {
        let record = LocalRecord::new_local("events", "evt-1", fields(json!({"title": "A"})), 1000);

        assert!(record.dirty);
        assert!(record.is_active());
        assert!(!record.exists_remotely());
        assert_eq!(record.key(), EntityKey::new("events", "evt-1"));
    }

    #[test]
    fn apply_update_merges_fields() {
        let mut record =
            LocalRecord::new_local("events", "evt-1", fields(json!({"title": "A", "start": 9})), 1000);

        record.apply_local(&Mutation::update(
            "m-2",
            "events",
            "evt-1",
            fields(json!({"start": 10})),
            2000,
        ));

        assert_eq!(record.fields, fields(json!({"title": "A", "start": 10})));
        assert_eq!(record.updated_at, 2000);
    }

    #[test]
    fn apply_delete_sets_tombstone() {
        let mut record = LocalRecord::new_local("events", "evt-1", Payload::new(), 1000);
        record.apply_local(&Mutation::delete("m-3", "events", "evt-1", 3000));

        assert!(record.deleted);
        assert!(!record.is_active());
    }

    #[test]
    fn apply_remote_ignores_stale_versions() {
        let remote = RemoteRecord::new("events", "evt-1", fields(json!({"title": "v2"})), 2);
        let mut record = LocalRecord::from_remote(&remote, 1000);
        assert_eq!(record.server_version, Some(2));
        assert!(!record.dirty);

        let stale = RemoteRecord::new("events", "evt-1", fields(json!({"title": "v1"})), 1);
        assert!(!record.apply_remote(&stale, 2000));
        assert!(!record.apply_remote(&remote, 2000));
        assert_eq!(record.fields, fields(json!({"title": "v2"})));

        let newer = RemoteRecord::new("events", "evt-1", fields(json!({"title": "v3"})), 3);
        assert!(record.apply_remote(&newer, 3000));
        assert_eq!(record.server_version, Some(3));
    }

    #[test]
    fn refresh_takes_same_version_but_not_older() {
        let remote = RemoteRecord::new("events", "evt-1", fields(json!({"title": "A"})), 4);
        let mut record = LocalRecord::from_remote(&remote, 1000);
        record.fields = fields(json!({"title": "rejected"}));
        record.needs_refresh = true;

        let older = RemoteRecord::new("events", "evt-1", fields(json!({"title": "old"})), 3);
        assert!(!record.apply_remote(&older, 2000));

        assert!(record.apply_remote(&remote, 2000));
        assert_eq!(record.fields, fields(json!({"title": "A"})));
        assert!(!record.needs_refresh);
        assert!(!record.apply_remote(&remote, 3000));
    }

    #[test]
    fn acknowledge_keeps_highest_version() {
        let mut record = LocalRecord::new_local("events", "evt-1", Payload::new(), 1000);
        record.acknowledge(5);
        record.acknowledge(3);
        assert_eq!(record.server_version, Some(5));
    }

    #[test]
    fn tombstone_is_empty() {
        let tomb = RemoteRecord::tombstone("events", "evt-1", 7);
        assert!(tomb.deleted);
        assert!(tomb.fields.is_empty());
    }

    #[test]
    fn serialization_roundtrip() {
        let record = LocalRecord::new_local("events", "evt-1", fields(json!({"title": "A"})), 1000);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("serverVersion"));
        let parsed: LocalRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(record, parsed);
    }
}
