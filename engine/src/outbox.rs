//! Outbox - the per-user queue of unacknowledged mutations.
//!
//! The outbox holds at most one pending mutation per entity. Entries are kept
//! in an index keyed by entity plus a sequence-ordered key list, so appends
//! merge in place and flushes replay entities in insertion order.

use crate::{
    error::Result,
    merge::{merge, MergeOutcome},
    EntityKey, Error, Mutation, MutationId, MutationKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One entity's slot in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Position in flush order
    pub seq: u64,
    /// The single mutation to send for this entity
    pub mutation: Mutation,
    /// Insert of a new entity with the same id, held behind a pending delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<Mutation>,
    /// Set once the entry has been dispatched; the server may know the entity
    #[serde(default)]
    pub maybe_remote: bool,
}

impl OutboxEntry {
    pub fn key(&self) -> EntityKey {
        self.mutation.key()
    }
}

/// Result of appending a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new entry was created
    Queued,
    /// The existing entry was replaced by the merged mutation
    Merged,
    /// The entry was removed, or nothing was ever queued
    Cancelled,
    /// The mutation was parked behind a pending delete
    Deferred,
    /// The mutation was dropped and the entry left as it was
    Ignored,
}

impl AppendOutcome {
    /// Whether the outbox contents changed.
    pub fn changed(self) -> bool {
        !matches!(self, AppendOutcome::Ignored)
    }
}

/// An entry removed by acknowledgment or rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    /// The entry that was removed
    pub entry: OutboxEntry,
    /// A deferred insert that took the entity's place
    pub promoted: Option<OutboxEntry>,
}

/// Per-user outbox.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    entries: HashMap<EntityKey, OutboxEntry>,
    order: BTreeMap<u64, EntityKey>,
    by_mutation: HashMap<MutationId, EntityKey>,
    next_seq: u64,
}

impl Outbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an outbox from persisted entries, as they were stored.
    pub fn restore(entries: impl IntoIterator<Item = OutboxEntry>) -> Result<Self> {
        let mut outbox = Self::new();
        for entry in entries {
            let key = entry.key();
            if outbox.entries.contains_key(&key) || outbox.order.contains_key(&entry.seq) {
                return Err(Error::DuplicateEntry(key.to_string()));
            }
            outbox.next_seq = outbox.next_seq.max(entry.seq + 1);
            outbox.insert_entry(entry);
        }
        Ok(outbox)
    }

    /// Merge a mutation into the entry for its entity.
    ///
    /// `exists_remotely` is whether the server has acknowledged the entity
    /// before; a dispatched entry counts as remote regardless.
    pub fn append(&mut self, incoming: Mutation, exists_remotely: bool) -> AppendOutcome {
        let key = incoming.key();

        let Some(entry) = self.entries.get_mut(&key) else {
            return match merge(None, incoming, exists_remotely) {
                MergeOutcome::Queue(mutation) => {
                    let seq = self.take_seq();
                    self.insert_entry(OutboxEntry {
                        seq,
                        mutation,
                        deferred: None,
                        maybe_remote: false,
                    });
                    AppendOutcome::Queued
                }
                MergeOutcome::Cancel | MergeOutcome::Keep => AppendOutcome::Cancelled,
            };
        };

        if entry.mutation.is_delete() {
            return Self::append_deferred(entry, incoming);
        }

        let exists_remotely = exists_remotely || entry.maybe_remote;
        match merge(Some(&entry.mutation), incoming, exists_remotely) {
            MergeOutcome::Queue(mutation) => {
                let previous = std::mem::replace(&mut entry.mutation, mutation);
                let current = entry.mutation.id.clone();
                self.by_mutation.remove(&previous.id);
                self.by_mutation.insert(current, key);
                AppendOutcome::Merged
            }
            MergeOutcome::Cancel => {
                self.remove_entry(&key);
                AppendOutcome::Cancelled
            }
            MergeOutcome::Keep => AppendOutcome::Ignored,
        }
    }

    /// A pending delete never absorbs later writes; a re-insert becomes a
    /// deferred new entity that merges only with its own successors.
    fn append_deferred(entry: &mut OutboxEntry, incoming: Mutation) -> AppendOutcome {
        match entry.deferred.take() {
            Some(deferred) => match merge(Some(&deferred), incoming, false) {
                MergeOutcome::Queue(mutation) => {
                    entry.deferred = Some(mutation);
                    AppendOutcome::Deferred
                }
                MergeOutcome::Cancel => AppendOutcome::Cancelled,
                MergeOutcome::Keep => {
                    entry.deferred = Some(deferred);
                    AppendOutcome::Ignored
                }
            },
            None if incoming.kind == MutationKind::Insert => {
                entry.deferred = Some(incoming);
                AppendOutcome::Deferred
            }
            None => AppendOutcome::Ignored,
        }
    }

    /// Mutations to flush, in entity insertion order.
    pub fn list(&self) -> impl Iterator<Item = &Mutation> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key))
            .map(|entry| &entry.mutation)
    }

    /// Owned copy of [`Outbox::list`] for handing to a flush.
    pub fn snapshot(&self) -> Vec<Mutation> {
        self.list().cloned().collect()
    }

    /// All entries in flush order.
    pub fn entries(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.order.values().filter_map(|key| self.entries.get(key))
    }

    /// Number of entities with a pending mutation.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &EntityKey) -> Option<&OutboxEntry> {
        self.entries.get(key)
    }

    /// Find the entity whose current mutation has this ID.
    pub fn key_for(&self, id: &str) -> Option<&EntityKey> {
        self.by_mutation.get(id)
    }

    /// Flag entries as dispatched. Returns the keys that changed.
    pub fn mark_dispatched(&mut self, ids: &[MutationId]) -> Vec<EntityKey> {
        let mut changed = Vec::new();
        for id in ids {
            let Some(key) = self.by_mutation.get(id) else {
                continue;
            };
            if let Some(entry) = self.entries.get_mut(key) {
                if !entry.maybe_remote {
                    entry.maybe_remote = true;
                    changed.push(key.clone());
                }
            }
        }
        changed
    }

    /// Count a failed delivery against each still-current mutation.
    pub fn record_attempt(&mut self, ids: &[MutationId]) -> Vec<EntityKey> {
        let mut changed = Vec::new();
        for id in ids {
            let Some(key) = self.by_mutation.get(id) else {
                continue;
            };
            if let Some(entry) = self.entries.get_mut(key) {
                entry.mutation.attempts = entry.mutation.attempts.saturating_add(1);
                changed.push(key.clone());
            }
        }
        changed
    }

    /// Remove entries whose current mutation is one of `ids`.
    ///
    /// IDs that were superseded by a later merge are skipped, so the merged
    /// state stays queued. A deferred insert is promoted to a fresh entry at
    /// the end of the flush order.
    pub fn remove(&mut self, ids: &[MutationId]) -> Vec<Removal> {
        let mut removals = Vec::new();
        for id in ids {
            let Some(key) = self.by_mutation.get(id).cloned() else {
                continue;
            };
            let Some(mut entry) = self.remove_entry(&key) else {
                continue;
            };

            let promoted = entry.deferred.take().map(|mutation| {
                let promoted = OutboxEntry {
                    seq: self.take_seq(),
                    mutation,
                    deferred: None,
                    maybe_remote: false,
                };
                self.insert_entry(promoted.clone());
                promoted
            });

            removals.push(Removal { entry, promoted });
        }
        removals
    }

    /// Drop an entity's entry outright, e.g. when the server deleted it.
    pub fn drop_entity(&mut self, key: &EntityKey) -> Option<OutboxEntry> {
        self.remove_entry(key)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert_entry(&mut self, entry: OutboxEntry) {
        let key = entry.key();
        self.order.insert(entry.seq, key.clone());
        self.by_mutation.insert(entry.mutation.id.clone(), key.clone());
        self.entries.insert(key, entry);
    }

    fn remove_entry(&mut self, key: &EntityKey) -> Option<OutboxEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        self.by_mutation.remove(&entry.mutation.id);
        Some(entry)
    }
}
