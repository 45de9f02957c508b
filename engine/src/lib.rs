//! # Stash Engine
//!
//! The deterministic core of an offline-first mutation sync engine.
//!
//! This crate decides *what* has to reach the server. It holds no IO: the
//! async runtime that flushes and pulls lives in `stash-sync`, and talks to
//! this crate through plain values.
//!
//! ## Core Concepts
//!
//! ### Mutations
//!
//! Local writes are expressed as [`Mutation`]s against exactly one entity:
//! - [`MutationKind::Insert`] - full payload
//! - [`MutationKind::Update`] - partial payload, merged per field
//! - [`MutationKind::Delete`] - empty payload
//!
//! ### Merging
//!
//! [`merge`] folds a new mutation into the one already queued for the same
//! entity. An insert followed by a delete before anything was sent collapses
//! to nothing; a delete of a synced entity discards queued fields.
//!
//! ### Outbox
//!
//! The [`Outbox`] keeps at most one pending mutation per entity, replayed in
//! entity insertion order. Entries survive restarts through [`PersistedEntry`].
//!
//! ## Quick Start
//!
//! ```rust
//! use stash_engine::{payload_from_value, Mutation, Outbox};
//! use serde_json::json;
//!
//! let mut outbox = Outbox::new();
//! let title = |t: &str| payload_from_value(json!({ "title": t })).unwrap();
//!
//! outbox.append(Mutation::insert("m-1", "events", "evt-1", title("A"), 1000), false);
//! outbox.append(Mutation::update("m-2", "events", "evt-1", title("B"), 1001), false);
//! assert_eq!(outbox.count(), 1);
//!
//! // Deleting before the first flush leaves nothing to send
//! outbox.append(Mutation::delete("m-3", "events", "evt-1", 1002), false);
//! assert!(outbox.is_empty());
//! ```

pub mod error;
pub mod merge;
pub mod mutation;
pub mod outbox;
pub mod persist;
pub mod record;

// Re-export main types at crate root
pub use error::Error;
pub use merge::{merge, merge_fields, MergeOutcome};
pub use mutation::{payload_from_value, EntityKey, Mutation, MutationKind, Payload};
pub use outbox::{AppendOutcome, Outbox, OutboxEntry, Removal};
pub use persist::{
    cursor_row_id, outbox_row_id, record_row_id, PersistedCursor, PersistedEntry, CURSOR_TABLE,
    OUTBOX_TABLE, PERSIST_FORMAT_VERSION,
};
pub use record::{LocalRecord, RemoteRecord};

/// Type aliases for clarity
pub type EntityId = String;
pub type TableName = String;
pub type MutationId = String;
pub type UserId = String;
pub type Version = u64;
pub type Timestamp = u64;
