//! Per-user session state.
//!
//! Each user with local activity gets a [`UserSession`] holding the in-memory
//! outbox, the staged pull versions and the scheduling state of the push
//! coordinator. Sessions live in a [`SessionRegistry`] owned by the engine.

use crate::config::RetryConfig;
use crate::error::Result;
use crate::push::FlushResult;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use stash_engine::{EntityKey, Outbox, RemoteRecord, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Result of the in-flight flush, awaitable by any number of callers.
pub(crate) type SharedFlush = Shared<BoxFuture<'static, Result<FlushResult>>>;

/// State guarded by the session's queue lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct UserQueue {
    pub outbox: Outbox,
    /// Pulled versions of dirty entities, held until their mutation settles
    pub staged: HashMap<EntityKey, RemoteRecord>,
}

impl UserQueue {
    /// Stage a pulled version, keeping the highest one seen.
    pub fn stage(&mut self, remote: RemoteRecord) {
        let key = remote.key();
        match self.staged.get(&key) {
            Some(current) if current.version >= remote.version => {}
            _ => {
                self.staged.insert(key, remote);
            }
        }
    }
}

pub(crate) struct Flight {
    pub id: u64,
    pub epoch: u64,
    pub result: SharedFlush,
}

#[derive(Debug, Default)]
struct Backoff {
    attempt: u32,
    retry_at: Option<Instant>,
}

pub(crate) struct UserSession {
    pub user_id: UserId,
    pub queue: tokio::sync::Mutex<UserQueue>,
    pending: AtomicUsize,
    generation: AtomicU64,
    epoch: watch::Sender<u64>,
    timer: Mutex<Option<JoinHandle<()>>>,
    pull_loop: Mutex<Option<JoinHandle<()>>>,
    flight: Mutex<Option<Flight>>,
    backoff: Mutex<Backoff>,
}

impl UserSession {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            user_id: user_id.into(),
            queue: tokio::sync::Mutex::new(UserQueue::default()),
            pending: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            epoch,
            timer: Mutex::new(None),
            pull_loop: Mutex::new(None),
            flight: Mutex::new(None),
            backoff: Mutex::new(Backoff::default()),
        }
    }

    /// Number of queued entries, readable without the queue lock.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn set_pending(&self, count: usize) {
        self.pending.store(count, Ordering::SeqCst);
    }

    /// Counter bumped by every append that changed the outbox.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Resolves once the session moves past `epoch`.
    pub async fn cancelled(&self, epoch: u64) {
        let mut rx = self.epoch.subscribe();
        if rx.wait_for(|current| *current != epoch).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Start a new epoch: stop timers and the pull loop and forget the flight.
    /// Returns the new epoch.
    pub fn end(&self) -> u64 {
        self.epoch.send_modify(|epoch| *epoch += 1);
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        if let Some(pull_loop) = self.pull_loop.lock().take() {
            pull_loop.abort();
        }
        self.flight.lock().take();
        *self.backoff.lock() = Backoff::default();
        self.epoch()
    }

    /// Install a debounce or retry timer, aborting the previous one.
    pub fn replace_timer(&self, timer: JoinHandle<()>) {
        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.abort();
        }
    }

    pub fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    pub fn replace_pull_loop(&self, pull_loop: JoinHandle<()>) {
        if let Some(previous) = self.pull_loop.lock().replace(pull_loop) {
            previous.abort();
        }
    }

    /// Join the flight of this epoch, or start one with `start`.
    ///
    /// `start` runs under the slot lock, so two callers never both start.
    /// Returns `None` when there is no flight and `start` declined.
    pub fn join_or_start(
        &self,
        epoch: u64,
        start: impl FnOnce() -> Option<Flight>,
    ) -> Option<SharedFlush> {
        let mut slot = self.flight.lock();
        if let Some(flight) = slot.as_ref().filter(|f| f.epoch == epoch) {
            return Some(flight.result.clone());
        }
        let flight = start()?;
        let result = flight.result.clone();
        *slot = Some(flight);
        Some(result)
    }

    /// Clear the flight slot if it still holds flight `id`.
    pub fn finish_flight(&self, id: u64) {
        let mut slot = self.flight.lock();
        if slot.as_ref().is_some_and(|f| f.id == id) {
            *slot = None;
        }
    }

    /// Time left before a retry is allowed.
    pub fn backoff_remaining(&self) -> Duration {
        self.backoff
            .lock()
            .retry_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Count a failed flush and return the delay before the next attempt.
    pub fn record_failure(&self, retry: &RetryConfig) -> Duration {
        let mut backoff = self.backoff.lock();
        backoff.attempt = backoff.attempt.saturating_add(1);
        let delay = retry.delay_for_attempt(backoff.attempt);
        backoff.retry_at = Some(Instant::now() + delay);
        delay
    }

    pub fn reset_backoff(&self) {
        *self.backoff.lock() = Backoff::default();
    }
}

/// All sessions of one engine instance.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: DashMap<UserId, Arc<UserSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<UserSession>> {
        self.sessions.get(user_id).map(|s| Arc::clone(s.value()))
    }

    pub fn get_or_create(&self, user_id: &str) -> Arc<UserSession> {
        if let Some(session) = self.get(user_id) {
            return session;
        }
        self.sessions
            .entry(user_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(user_id = %user_id, "session created");
                Arc::new(UserSession::new(user_id))
            })
            .clone()
    }

    pub fn all(&self) -> Vec<Arc<UserSession>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }
}
