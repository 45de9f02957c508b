//! Push coordinator - debounced, single-flight outbox flushing.
//!
//! Appends arm a per-user debounce timer; when it fires, the outbox is
//! snapshotted and sent as one batch. At most one flush per user is in
//! flight: later callers await the same shared result. Acknowledged and
//! rejected entries are removed in one local transaction; everything else
//! stays queued and is retried with backoff.

use crate::engine::{now_millis, Context};
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::local::{records, Txn};
use crate::pull::settle_staged;
use crate::remote::MutationOutcome;
use crate::session::{Flight, UserQueue, UserSession};
use futures::FutureExt;
use stash_engine::{
    EntityKey, Mutation, MutationId, MutationKind, TableName, Timestamp, Version,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::slice;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushResult {
    /// Mutations the server acknowledged
    pub pushed: Vec<MutationId>,
    /// Mutations the server refused permanently
    pub rejected: Vec<RejectedMutation>,
    /// Mutations sent without receiving an outcome; they stay queued
    pub unacknowledged: usize,
    /// Entries left in the outbox afterwards
    pub remaining: usize,
}

/// A mutation the server refused.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedMutation {
    pub mutation_id: MutationId,
    pub key: EntityKey,
    pub reason: String,
}

impl From<&RejectedMutation> for SyncError {
    fn from(rejected: &RejectedMutation) -> Self {
        SyncError::ServerRejectedMutation {
            mutation_id: rejected.mutation_id.clone(),
            reason: rejected.reason.clone(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct PushCoordinator {
    ctx: Arc<Context>,
}

impl PushCoordinator {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Arm the debounce timer, never earlier than a pending backoff allows.
    pub fn schedule(&self, session: &Arc<UserSession>) {
        let delay = self.ctx.config.debounce.max(session.backoff_remaining());
        self.schedule_after(session, delay);
    }

    fn schedule_after(&self, session: &Arc<UserSession>, delay: Duration) {
        let this = self.clone();
        let task_session = Arc::clone(session);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = this.flush(&task_session).await {
                debug!(user_id = %task_session.user_id, error = %err, "scheduled flush did not complete");
            }
        });
        session.replace_timer(timer);
    }

    /// Flush immediately, ignoring the debounce window and any backoff.
    pub async fn flush_now(&self, user_id: &str) -> Result<FlushResult> {
        let session = self.ctx.sessions.get_or_create(user_id);
        session.cancel_timer();
        self.flush(&session).await
    }

    /// Join the in-flight flush or start one if anything is queued.
    pub async fn flush(&self, session: &Arc<UserSession>) -> Result<FlushResult> {
        let epoch = session.epoch();
        let flight = session.join_or_start(epoch, || {
            (session.pending() > 0).then(|| self.start_flight(session, epoch))
        });
        let Some(flight) = flight else {
            return Ok(FlushResult::default());
        };

        tokio::select! {
            result = flight => result,
            _ = session.cancelled(epoch) => Err(SyncError::Cancelled),
        }
    }

    fn start_flight(&self, session: &Arc<UserSession>, epoch: u64) -> Flight {
        let id = self.ctx.next_flight_id();
        let this = self.clone();
        let task_session = Arc::clone(session);
        let handle = tokio::spawn(async move { this.run_flight(task_session, id, epoch).await });

        let result = async move {
            handle
                .await
                .unwrap_or_else(|err| Err(SyncError::Internal(format!("flush task failed: {err}"))))
        }
        .boxed()
        .shared();

        Flight { id, epoch, result }
    }

    async fn run_flight(self, session: Arc<UserSession>, id: u64, epoch: u64) -> Result<FlushResult> {
        let generation = session.generation();
        let result = self.dispatch(&session, epoch).await;
        session.finish_flight(id);

        if session.epoch() != epoch {
            return result;
        }

        match &result {
            Ok(flush) if flush.unacknowledged > 0 => {
                self.retry_later(&session, format!("{} mutations unacknowledged", flush.unacknowledged));
            }
            Ok(_) => {
                session.reset_backoff();
                if session.generation() != generation && session.pending() > 0 {
                    debug!(user_id = %session.user_id, "appends during flush, scheduling follow-up");
                    self.schedule(&session);
                }
            }
            Err(SyncError::Cancelled) => {}
            Err(err) => self.retry_later(&session, err.to_string()),
        }
        result
    }

    fn retry_later(&self, session: &Arc<UserSession>, error: String) {
        let delay = session.record_failure(&self.ctx.config.retry);
        warn!(
            user_id = %session.user_id,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "flush failed, will retry"
        );
        self.ctx.events.emit(SyncEvent::FlushFailed {
            user_id: session.user_id.clone(),
            error,
            retry_in: Some(delay),
        });
        self.schedule_after(session, delay);
    }

    async fn dispatch(&self, session: &UserSession, epoch: u64) -> Result<FlushResult> {
        let user_id = session.user_id.as_str();
        let batch = self.snapshot(session).await?;
        if batch.is_empty() {
            return Ok(FlushResult::default());
        }

        debug!(user_id = %user_id, count = batch.len(), "pushing batch");
        let response = self.ctx.remote.push_batch(user_id, &batch).await;

        if session.epoch() != epoch {
            debug!(user_id = %user_id, "session ended during push, ignoring result");
            return Err(SyncError::Cancelled);
        }

        match response {
            Ok(outcomes) => self.settle(session, &batch, outcomes).await,
            Err(err) => {
                let err = SyncError::from(err);
                if let Err(persist) = self.count_attempt(session, &batch).await {
                    warn!(user_id = %user_id, error = %persist, "could not persist attempt count");
                }
                Err(err)
            }
        }
    }

    /// Take the flush snapshot and persist the dispatched flags first, so a
    /// restart knows the server may have seen these entities.
    async fn snapshot(&self, session: &UserSession) -> Result<Vec<Mutation>> {
        let mut queue = session.queue.lock().await;
        let batch = queue.outbox.snapshot();
        let ids: Vec<MutationId> = batch.iter().map(|m| m.id.clone()).collect();

        let mut next = queue.outbox.clone();
        let changed = next.mark_dispatched(&ids);
        if !changed.is_empty() {
            let mut txn = Txn::new();
            for key in &changed {
                if let Some(entry) = next.entry(key) {
                    txn.put_entry(&session.user_id, entry)?;
                }
            }
            self.ctx.commit(&session.user_id, txn).await?;
            queue.outbox = next;
        }
        Ok(batch)
    }

    async fn count_attempt(&self, session: &UserSession, batch: &[Mutation]) -> Result<()> {
        let ids: Vec<MutationId> = batch.iter().map(|m| m.id.clone()).collect();
        let mut queue = session.queue.lock().await;
        let mut next = queue.outbox.clone();

        let mut txn = Txn::new();
        for key in next.record_attempt(&ids) {
            if let Some(entry) = next.entry(&key) {
                txn.put_entry(&session.user_id, entry)?;
            }
        }
        self.ctx.commit(&session.user_id, txn).await?;
        queue.outbox = next;
        Ok(())
    }

    /// Apply per-mutation outcomes to the outbox and the local records.
    async fn settle(
        &self,
        session: &UserSession,
        batch: &[Mutation],
        outcomes: Vec<MutationOutcome>,
    ) -> Result<FlushResult> {
        let user_id = session.user_id.as_str();
        let sent: HashMap<&str, &Mutation> = batch.iter().map(|m| (m.id.as_str(), m)).collect();
        let now = now_millis();

        let mut queue = session.queue.lock().await;
        let mut next = queue.clone();
        let mut txn = Txn::new();
        let mut result = FlushResult::default();
        let mut answered: HashSet<&str> = HashSet::new();
        let mut rewinds: BTreeMap<TableName, u64> = BTreeMap::new();

        for outcome in &outcomes {
            let Some(mutation) = sent.get(outcome.mutation_id().as_str()).copied() else {
                debug!(user_id = %user_id, mutation_id = %outcome.mutation_id(), "outcome for unknown mutation ignored");
                continue;
            };
            if !answered.insert(mutation.id.as_str()) {
                continue;
            }

            match outcome {
                MutationOutcome::Applied { server_version, .. } => {
                    self.acknowledge(user_id, &mut next, &mut txn, mutation, *server_version, now)
                        .await?;
                    result.pushed.push(mutation.id.clone());
                }
                MutationOutcome::Rejected { reason, .. } => {
                    self.reject(user_id, &mut next, &mut txn, &mut rewinds, mutation, now)
                        .await?;
                    result.rejected.push(RejectedMutation {
                        mutation_id: mutation.id.clone(),
                        key: mutation.key(),
                        reason: reason.clone(),
                    });
                }
            }
        }

        let unanswered: Vec<MutationId> = batch
            .iter()
            .filter(|m| !answered.contains(m.id.as_str()))
            .map(|m| m.id.clone())
            .collect();
        for key in next.outbox.record_attempt(&unanswered) {
            if let Some(entry) = next.outbox.entry(&key) {
                txn.put_entry(user_id, entry)?;
            }
            result.unacknowledged += 1;
        }

        for (table, target) in &rewinds {
            let cursor = records::load_cursor(self.ctx.store.as_ref(), user_id, table).await?;
            if cursor > *target {
                txn.put_cursor(user_id, table, *target)?;
            }
        }

        self.ctx.commit(user_id, txn).await?;
        *queue = next;
        result.remaining = queue.outbox.count();
        session.set_pending(result.remaining);
        drop(queue);

        for rejected in &result.rejected {
            warn!(
                user_id = %user_id,
                key = %rejected.key,
                error = %SyncError::from(rejected),
                "mutation rejected"
            );
            self.ctx.events.emit(SyncEvent::MutationRejected {
                user_id: user_id.to_string(),
                mutation_id: rejected.mutation_id.clone(),
                key: rejected.key.clone(),
                reason: rejected.reason.clone(),
            });
        }

        info!(
            user_id = %user_id,
            pushed = result.pushed.len(),
            rejected = result.rejected.len(),
            remaining = result.remaining,
            "flush completed"
        );
        self.ctx.events.emit(SyncEvent::FlushCompleted {
            user_id: user_id.to_string(),
            pushed: result.pushed.len(),
            rejected: result.rejected.len(),
            remaining: result.remaining,
        });

        Ok(result)
    }

    async fn acknowledge(
        &self,
        user_id: &str,
        queue: &mut UserQueue,
        txn: &mut Txn,
        mutation: &Mutation,
        version: Version,
        now: Timestamp,
    ) -> Result<()> {
        let key = mutation.key();
        // Superseded ids remove nothing; the merged state stays queued
        let removal = queue.outbox.remove(slice::from_ref(&mutation.id)).pop();
        let promoted = removal.as_ref().and_then(|r| r.promoted.as_ref());
        match promoted {
            Some(entry) => txn.put_entry(user_id, entry)?,
            None if removal.is_some() => txn.delete_entry(user_id, &key),
            None => {}
        }

        let Some(mut record) = records::load_record(self.ctx.store.as_ref(), user_id, &key).await? else {
            return Ok(());
        };

        if mutation.kind == MutationKind::Delete {
            queue.staged.remove(&key);
            if promoted.is_some() {
                // The re-inserted entity has never been synced
                record.server_version = None;
                record.dirty = true;
                txn.put_record(user_id, &record)?;
            } else {
                txn.delete_record(user_id, &key);
            }
            return Ok(());
        }

        record.acknowledge(version);
        record.dirty = queue.outbox.contains(&key);
        if !record.dirty {
            settle_staged(queue, &mut record, now);
        }
        txn.put_record(user_id, &record)
    }

    async fn reject(
        &self,
        user_id: &str,
        queue: &mut UserQueue,
        txn: &mut Txn,
        rewinds: &mut BTreeMap<TableName, u64>,
        mutation: &Mutation,
        now: Timestamp,
    ) -> Result<()> {
        let key = mutation.key();
        let Some(removal) = queue.outbox.remove(slice::from_ref(&mutation.id)).pop() else {
            return Ok(());
        };
        match &removal.promoted {
            Some(entry) => txn.put_entry(user_id, entry)?,
            None => txn.delete_entry(user_id, &key),
        }

        let Some(mut record) = records::load_record(self.ctx.store.as_ref(), user_id, &key).await? else {
            return Ok(());
        };

        record.dirty = queue.outbox.contains(&key);
        match mutation.kind {
            MutationKind::Insert if !record.exists_remotely() && !record.dirty => {
                queue.staged.remove(&key);
                txn.delete_record(user_id, &key);
                return Ok(());
            }
            MutationKind::Delete => record.deleted = false,
            _ => {}
        }
        if !record.dirty && !settle_staged(queue, &mut record, now) {
            if let Some(version) = record.server_version {
                // The server copy has to come back with the next pull
                record.needs_refresh = true;
                let target = version.saturating_sub(1);
                rewinds
                    .entry(key.table.clone())
                    .and_modify(|c| *c = (*c).min(target))
                    .or_insert(target);
            }
        }
        txn.put_record(user_id, &record)
    }
}
