//! # Stash Sync
//!
//! Async runtime around `stash-engine`: applies local writes optimistically,
//! pushes the outbox to a remote backend with debouncing and retries, and
//! pulls remote changes without clobbering pending local edits.
//!
//! ```no_run
//! use serde_json::json;
//! use stash_engine::{payload_from_value, MutationKind};
//! use stash_sync::{Config, MemoryBackend, MemoryStore, SyncEngine};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SyncEngine::open(
//!     Config::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryBackend::new()),
//! )
//! .await?;
//!
//! let fields = payload_from_value(json!({ "title": "Standup" }))?;
//! engine
//!     .enqueue_mutation("alice", "events", MutationKind::Insert, "evt-1", fields)
//!     .await?;
//!
//! let flushed = engine.flush_now("alice").await?;
//! assert_eq!(flushed.remaining, 0);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod local;
pub mod pull;
pub mod push;
pub mod remote;
mod session;

pub use config::{Config, ConfigError, RetryConfig};
pub use engine::{Enqueued, SyncEngine};
pub use error::{Result, SyncError};
pub use events::{EventBus, SyncEvent};
pub use local::{LocalStore, MemoryStore, StoreError, StoreWrite};
pub use pull::{Conflict, PullResult};
pub use push::{FlushResult, RejectedMutation};
pub use remote::{
    ChangeSet, DeleteRequest, MemoryBackend, MutationOutcome, RemoteBackend, RemoteError,
    UpsertRequest,
};
