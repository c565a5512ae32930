use std::sync::Arc;
use std::thread;

use anyhow::Context;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use tryout_events::{EventBus, EventEnvelope, InMemoryEventBus};
use tryout_infra::EngineConfig;
use tryout_infra::engine::SessionEngine;
use tryout_infra::settlement::{InMemoryInternalLedger, SettlementService, UnconfiguredGateway};
use tryout_infra::store::{InMemorySessionStore, PostgresSessionStore, SessionStore};
use tryout_infra::sweeper::{DeadlineSweeper, SweepWorker, SweepWorkerConfig};

type Bus = InMemoryEventBus<EventEnvelope<Value>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tryout_observability::init();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let store = build_store(&config).await?;

    let bus: Arc<Bus> = Arc::new(InMemoryEventBus::new());
    spawn_notification_log(&bus).context("failed to start notification listener")?;

    let settlement = SettlementService::new(Arc::new(UnconfiguredGateway), Arc::new(InMemoryInternalLedger::new()));
    let engine = Arc::new(SessionEngine::new(store, bus, settlement));

    let worker_config = SweepWorkerConfig::default()
        .with_interval(config.sweep_interval)
        .with_run_on_start(config.sweep_on_start);
    let worker = SweepWorker::new(DeadlineSweeper::new(engine))
        .spawn(worker_config)
        .context("failed to start the deadline sweeper")?;

    info!(interval_secs = config.sweep_interval.as_secs(), "tryout worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    info!(stats = ?worker.stats(), "shutting down");
    tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("sweep worker did not stop cleanly")?;
    Ok(())
}

async fn build_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
    let Some(url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set; using the in-memory session store");
        return Ok(Arc::new(InMemorySessionStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresSessionStore::new(pool, tokio::runtime::Handle::current());
    store.migrate().await.context("failed to apply the schema")?;
    info!(max_connections = config.db_max_connections, "using the Postgres session store");
    Ok(Arc::new(store))
}

/// Stand-in for the notification service: logs every published envelope.
fn spawn_notification_log(bus: &Arc<Bus>) -> std::io::Result<()> {
    let subscription = bus.subscribe();
    thread::Builder::new().name("notifications".to_string()).spawn(move || {
        while let Ok(envelope) = subscription.recv() {
            info!(
                target: "notifications",
                event_type = envelope.event_type(),
                aggregate_id = %envelope.aggregate_id(),
                sequence_number = envelope.sequence_number(),
                "notification emitted"
            );
        }
    })?;
    Ok(())
}
