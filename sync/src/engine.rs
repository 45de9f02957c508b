//! The public sync engine.
//!
//! [`SyncEngine`] ties the local store, the remote backend and the per-user
//! sessions together. Local writes are applied optimistically and queued in
//! one local transaction; pushing and pulling happen in the background or on
//! demand.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::local::{records, LocalStore, Txn};
use crate::pull::{settle_staged, PullResult, PullSynchronizer};
use crate::push::{FlushResult, PushCoordinator};
use crate::remote::RemoteBackend;
use crate::session::SessionRegistry;
use stash_engine::{
    AppendOutcome, LocalRecord, Mutation, MutationId, MutationKind, Outbox, Payload, Timestamp,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Current wall-clock time in milliseconds since the epoch.
pub(crate) fn now_millis() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// State shared by the engine, the push coordinator and the pull synchronizer.
pub(crate) struct Context {
    pub config: Config,
    pub store: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteBackend>,
    pub events: EventBus,
    pub sessions: SessionRegistry,
    flight_ids: AtomicU64,
}

impl Context {
    /// Commit a user's transaction and announce the records it changed.
    pub async fn commit(&self, user_id: &str, txn: Txn) -> Result<()> {
        let keys = txn.commit(self.store.as_ref()).await?;
        if !keys.is_empty() {
            self.events.emit(SyncEvent::RecordsChanged {
                user_id: user_id.to_string(),
                keys,
            });
        }
        Ok(())
    }

    pub fn next_flight_id(&self) -> u64 {
        self.flight_ids.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Result of enqueueing a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub mutation_id: MutationId,
    pub outcome: AppendOutcome,
}

/// Offline-first sync engine.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncEngine {
    ctx: Arc<Context>,
    push: PushCoordinator,
    pull: PullSynchronizer,
}

impl SyncEngine {
    /// Open the engine, reloading persisted outboxes and scheduling their flush.
    pub async fn open(
        config: Config,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteBackend>,
    ) -> Result<Self> {
        let ctx = Arc::new(Context {
            events: EventBus::new(config.event_capacity),
            config,
            store,
            remote,
            sessions: SessionRegistry::new(),
            flight_ids: AtomicU64::new(0),
        });
        let engine = Self {
            push: PushCoordinator::new(Arc::clone(&ctx)),
            pull: PullSynchronizer::new(Arc::clone(&ctx)),
            ctx,
        };
        engine.restore().await?;
        Ok(engine)
    }

    async fn restore(&self) -> Result<()> {
        let outboxes = records::load_outboxes(self.ctx.store.as_ref()).await?;
        for (user_id, entries) in outboxes {
            let outbox = Outbox::restore(entries)?;
            let pending = outbox.count();

            let session = self.ctx.sessions.get_or_create(&user_id);
            session.queue.lock().await.outbox = outbox;
            session.set_pending(pending);

            info!(user_id = %user_id, pending, "restored outbox");
            if pending > 0 {
                self.push.schedule(&session);
            }
        }
        Ok(())
    }

    /// Apply a local write and queue it for the server.
    ///
    /// The record change and the outbox change commit together; if the local
    /// store fails, nothing is queued. Updating a missing record fails;
    /// deleting one is a no-op.
    pub async fn enqueue_mutation(
        &self,
        user_id: &str,
        table: &str,
        op: MutationKind,
        entity_id: &str,
        payload: Payload,
    ) -> Result<Enqueued> {
        let now = now_millis();
        let mutation = Mutation::new(
            uuid::Uuid::new_v4().to_string(),
            table,
            entity_id,
            op,
            payload,
            now,
        );
        mutation.validate()?;

        let key = mutation.key();
        let mutation_id = mutation.id.clone();
        let ignored = |mutation_id: MutationId| {
            Ok(Enqueued {
                mutation_id,
                outcome: AppendOutcome::Ignored,
            })
        };

        let session = self.ctx.sessions.get_or_create(user_id);
        let mut queue = session.queue.lock().await;

        let mut record = match records::load_record(self.ctx.store.as_ref(), user_id, &key).await? {
            Some(record) if record.is_active() || op == MutationKind::Insert => record,
            Some(_) | None if op == MutationKind::Delete => return ignored(mutation_id),
            None if op == MutationKind::Insert => {
                LocalRecord::new_local(table, entity_id, Payload::new(), now)
            }
            _ => return Err(SyncError::RecordNotFound(key.to_string())),
        };

        let mut next = queue.clone();
        let outcome = next.outbox.append(mutation.clone(), record.exists_remotely());
        if outcome == AppendOutcome::Ignored {
            debug!(user_id = %user_id, key = %key, "write behind pending delete ignored");
            return ignored(mutation_id);
        }
        record.apply_local(&mutation);

        let mut txn = Txn::new();
        match next.outbox.entry(&key) {
            Some(entry) => {
                txn.put_entry(user_id, entry)?;
                record.dirty = true;
                txn.put_record(user_id, &record)?;
            }
            None => {
                txn.delete_entry(user_id, &key);
                record.dirty = false;
                if settle_staged(&mut next, &mut record, now)
                    || (record.exists_remotely() && record.is_active())
                {
                    txn.put_record(user_id, &record)?;
                } else {
                    txn.delete_record(user_id, &key);
                }
            }
        }
        self.ctx.commit(user_id, txn).await?;

        *queue = next;
        session.set_pending(queue.outbox.count());
        session.bump_generation();
        drop(queue);

        debug!(
            user_id = %user_id,
            key = %key,
            mutation_id = %mutation_id,
            op = %op,
            outcome = ?outcome,
            "mutation enqueued"
        );
        if session.pending() > 0 {
            self.push.schedule(&session);
        }

        Ok(Enqueued {
            mutation_id,
            outcome,
        })
    }

    /// Flush a user's outbox now, joining a flush already in flight.
    pub async fn flush_now(&self, user_id: &str) -> Result<FlushResult> {
        self.push.flush_now(user_id).await
    }

    /// Pull remote changes for one table, or for every configured table.
    pub async fn pull_now(&self, user_id: &str, table: Option<&str>) -> Result<PullResult> {
        self.pull.pull_now(user_id, table).await
    }

    /// Number of entities with a pending mutation.
    pub fn get_pending_count(&self, user_id: &str) -> usize {
        self.ctx
            .sessions
            .get(user_id)
            .map_or(0, |session| session.pending())
    }

    /// Pending mutations in flush order.
    pub async fn pending_mutations(&self, user_id: &str) -> Vec<Mutation> {
        match self.ctx.sessions.get(user_id) {
            Some(session) => session.queue.lock().await.outbox.snapshot(),
            None => Vec::new(),
        }
    }

    /// A user's local copy of a record, unless it is deleted.
    pub async fn get_record(
        &self,
        user_id: &str,
        table: &str,
        entity_id: &str,
    ) -> Result<Option<LocalRecord>> {
        let key = stash_engine::EntityKey::new(table, entity_id);
        Ok(records::load_record(self.ctx.store.as_ref(), user_id, &key)
            .await?
            .filter(LocalRecord::is_active))
    }

    /// Subscribe to status events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    /// Start pulling every configured table on the configured interval.
    /// Returns false when no interval is configured.
    pub fn spawn_pull_loop(&self, user_id: &str) -> bool {
        let Some(interval) = self.ctx.config.pull_interval else {
            return false;
        };

        let session = self.ctx.sessions.get_or_create(user_id);
        let epoch = session.epoch();
        let pull = self.pull.clone();
        let task_session = Arc::clone(&session);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = pull.pull_now(&task_session.user_id, None).await {
                            warn!(user_id = %task_session.user_id, error = %err, "background pull failed");
                        }
                    }
                    _ = task_session.cancelled(epoch) => break,
                }
            }
        });
        session.replace_pull_loop(handle);
        true
    }

    /// End a user's session: stop timers and the pull loop, release waiters
    /// with [`SyncError::Cancelled`] and ignore the result of a push already
    /// sent. Queued mutations stay queued.
    pub fn end_session(&self, user_id: &str) {
        if let Some(session) = self.ctx.sessions.get(user_id) {
            let epoch = session.end();
            info!(user_id = %user_id, epoch, pending = session.pending(), "session ended");
        }
    }

    /// End every session.
    pub fn shutdown(&self) {
        for session in self.ctx.sessions.all() {
            session.end();
        }
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }
}
