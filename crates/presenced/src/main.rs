use anyhow::{Context, Result};
use presence_core::{
    AttendanceLedger, EmbeddingStore, EuclideanMatcher, IdentityService, MemoryEmbeddingStore,
    MemoryLedger, SystemClock,
};
use presence_store::Database;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::{Backend, BusKind, Config};
use dbus_interface::{PresenceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::load()?;
    tracing::info!(
        backend = ?config.backend,
        dim = config.embedding_dim,
        threshold = config.match_threshold,
        window_secs = config.dedup_window_secs,
        "configuration loaded"
    );

    let service = Arc::new(build_service(&config)?);

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, PresenceService::new(service))?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "presenced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}

fn build_service(config: &Config) -> Result<IdentityService> {
    let window = config.dedup_window()?;
    let dim = config.embedding_dim;

    let (store, ledger): (Arc<dyn EmbeddingStore>, Arc<dyn AttendanceLedger>) =
        match config.backend {
            Backend::Memory => {
                tracing::warn!("memory backend: registrations and attendance are not persisted");
                let store: Arc<dyn EmbeddingStore> = Arc::new(MemoryEmbeddingStore::new(dim));
                let ledger: Arc<dyn AttendanceLedger> =
                    Arc::new(MemoryLedger::new(window, Arc::clone(&store)));
                (store, ledger)
            }
            Backend::Sqlite => {
                let db = Database::open(&config.db_path).with_context(|| {
                    format!("opening database {}", config.db_path.display())
                })?;
                let store: Arc<dyn EmbeddingStore> = Arc::new(db.embedding_store(dim));
                let ledger: Arc<dyn AttendanceLedger> = Arc::new(db.ledger(window));
                (store, ledger)
            }
        };

    let service = IdentityService::new(
        store,
        ledger,
        EuclideanMatcher::new(dim, config.match_threshold),
        Arc::new(SystemClock),
    )?;
    Ok(service)
}
