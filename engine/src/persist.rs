//! Persisted forms of engine state.
//!
//! These envelopes are the bridge between the in-memory outbox and whatever
//! key/value store the host provides. Each outbox entry is stored on its own
//! so an append rewrites one row, not the whole queue.

use crate::{error::Result, Error, OutboxEntry, TableName, UserId};
use serde::{Deserialize, Serialize};

/// Version of the persisted format for future compatibility.
pub const PERSIST_FORMAT_VERSION: u32 = 1;

/// Reserved table holding outbox entries.
pub const OUTBOX_TABLE: &str = "_outbox";

/// Reserved table holding pull cursors.
pub const CURSOR_TABLE: &str = "_cursors";

/// A stored outbox entry tagged with its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEntry {
    pub format_version: u32,
    pub user_id: UserId,
    pub entry: OutboxEntry,
}

impl PersistedEntry {
    pub fn new(user_id: impl Into<UserId>, entry: OutboxEntry) -> Self {
        Self {
            format_version: PERSIST_FORMAT_VERSION,
            user_id: user_id.into(),
            entry,
        }
    }

    /// Row id of this entry inside [`OUTBOX_TABLE`].
    pub fn row_id(&self) -> String {
        outbox_row_id(&self.user_id, &self.entry.mutation.table, &self.entry.mutation.entity_id)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::Corrupt(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let persisted: Self =
            serde_json::from_value(value).map_err(|e| Error::Corrupt(e.to_string()))?;

        if persisted.format_version > PERSIST_FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported outbox format version: {} (max supported: {})",
                persisted.format_version, PERSIST_FORMAT_VERSION
            )));
        }

        Ok(persisted)
    }
}

/// A stored pull cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCursor {
    pub format_version: u32,
    pub cursor: u64,
}

impl PersistedCursor {
    pub fn new(cursor: u64) -> Self {
        Self {
            format_version: PERSIST_FORMAT_VERSION,
            cursor,
        }
    }
}

/// Row id of an outbox entry. Components are length-prefixed so ids
/// containing separators cannot collide.
pub fn outbox_row_id(user_id: &str, table: &str, entity_id: &str) -> String {
    format!("{}:{}:{}:{}:{}", user_id.len(), user_id, table.len(), table, entity_id)
}

/// Row id of a user's local copy of an entity inside the entity's table.
pub fn record_row_id(user_id: &str, entity_id: &str) -> String {
    format!("{}:{}:{}", user_id.len(), user_id, entity_id)
}

/// Row id of a cursor inside [`CURSOR_TABLE`].
pub fn cursor_row_id(user_id: &str, table: &TableName) -> String {
    format!("{}:{}:{}", user_id.len(), user_id, table)
}
