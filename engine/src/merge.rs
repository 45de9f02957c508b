//! Mutation coalescing.
//!
//! This is the core of the outbox's bounded-memory guarantee. Given the
//! mutation already queued for an entity and a new one, it produces the single
//! mutation that should remain queued, or decides nothing should be sent.
//!
//! # Rules
//!
//! | existing | incoming | outcome |
//! |---|---|---|
//! | none | insert / update | queue incoming |
//! | none | delete | queue if the entity exists remotely, else cancel |
//! | insert | insert / update | insert with fields merged |
//! | insert | delete | cancel unless the insert may have reached the server |
//! | update | insert / update | update with fields merged |
//! | update | delete | delete, queued fields discarded |
//! | delete | anything | keep the delete |
//!
//! Fields merge last-writer-wins per field by `created_at`; ties go to the
//! incoming mutation.

use crate::{Mutation, MutationKind, Payload};

/// What the outbox should do with an entity's entry after a merge.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Store this mutation as the entity's single pending entry
    Queue(Mutation),
    /// Remove the entry; nothing needs to reach the server
    Cancel,
    /// Leave the existing entry untouched and drop the incoming mutation
    Keep,
}

/// Combine an incoming mutation with whatever is queued for the same entity.
///
/// `exists_remotely` tells whether the server may already know the entity,
/// either because it was acknowledged before or because a queued insert has
/// been dispatched.
pub fn merge(existing: Option<&Mutation>, incoming: Mutation, exists_remotely: bool) -> MergeOutcome {
    let Some(existing) = existing else {
        return match incoming.kind {
            MutationKind::Delete if !exists_remotely => MergeOutcome::Cancel,
            _ => MergeOutcome::Queue(incoming),
        };
    };

    match (existing.kind, incoming.kind) {
        (MutationKind::Delete, _) => MergeOutcome::Keep,
        (MutationKind::Insert, MutationKind::Delete) if !exists_remotely => MergeOutcome::Cancel,
        (_, MutationKind::Delete) => MergeOutcome::Queue(Mutation {
            attempts: existing.attempts,
            ..incoming
        }),
        (kind, _) => MergeOutcome::Queue(coalesce(existing, incoming, kind)),
    }
}

/// Fold `incoming` into `existing`, keeping the existing kind.
fn coalesce(existing: &Mutation, incoming: Mutation, kind: MutationKind) -> Mutation {
    let incoming_is_newer = incoming.created_at >= existing.created_at;
    let payload = if incoming_is_newer {
        merge_fields(&existing.payload, incoming.payload)
    } else {
        merge_fields(&incoming.payload, existing.payload.clone())
    };

    Mutation {
        id: incoming.id,
        table: incoming.table,
        entity_id: incoming.entity_id,
        kind,
        payload,
        created_at: existing.created_at.max(incoming.created_at),
        attempts: existing.attempts,
    }
}

/// Overlay `newer` on top of `older`, field by field.
pub fn merge_fields(older: &Payload, newer: Payload) -> Payload {
    let mut merged = older.clone();
    for (field, value) in newer {
        merged.insert(field, value);
    }
    merged
}
