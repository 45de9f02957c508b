//! Stash Sync demo - runs a short offline-first session against the
//! in-memory store and backend.

use serde_json::json;
use stash_engine::{payload_from_value, MutationKind};
use stash_sync::{Config, MemoryBackend, MemoryStore, SyncEngine, SyncEvent};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stash_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        debounce_ms = config.debounce.as_millis() as u64,
        tables = ?config.tables,
        "Starting Stash sync demo"
    );

    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let engine = SyncEngine::open(config, store, backend.clone()).await?;

    let mut events = engine.subscribe();
    let user = "demo-user";

    // A burst of edits collapses into one insert
    engine
        .enqueue_mutation(
            user,
            "events",
            MutationKind::Insert,
            "evt-1",
            payload_from_value(json!({"title": "Standup", "start": "09:00"}))?,
        )
        .await?;
    engine
        .enqueue_mutation(
            user,
            "events",
            MutationKind::Update,
            "evt-1",
            payload_from_value(json!({"start": "09:30"}))?,
        )
        .await?;
    tracing::info!(pending = engine.get_pending_count(user), "Queued local edits");

    // Another device edits the same calendar
    backend
        .write_remote(
            user,
            "events",
            "evt-2",
            payload_from_value(json!({"title": "Lunch"}))?,
            0,
        )
        .await;

    let flushed = engine.flush_now(user).await?;
    tracing::info!(pushed = flushed.pushed.len(), remaining = flushed.remaining, "Flushed");

    let pulled = engine.pull_now(user, None).await?;
    tracing::info!(applied = pulled.applied, staged = pulled.staged, "Pulled");

    for id in ["evt-1", "evt-2"] {
        if let Some(record) = engine.get_record(user, "events", id).await? {
            tracing::info!(entity_id = id, fields = %serde_json::Value::Object(record.fields), "Local record");
        }
    }

    while let Ok(event) = events.try_recv() {
        if !matches!(event, SyncEvent::RecordsChanged { .. }) {
            tracing::debug!(?event, "Sync event");
        }
    }

    engine.shutdown();
    Ok(())
}
