//! Error types for the Stash engine.

use crate::MutationId;
use thiserror::Error;

/// All possible errors from the Stash engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid mutation {id}: {reason}")]
    InvalidMutation { id: MutationId, reason: String },

    // Persistence errors
    #[error("duplicate outbox entry for {0}")]
    DuplicateEntry(String),

    #[error("corrupt persisted state: {0}")]
    Corrupt(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
