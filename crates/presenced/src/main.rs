use anyhow::{Context, Result};
use presence_core::AttendanceLedger;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod upload;

use config::Config;
use dbus_interface::{PresenceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        data_dir = %config.data_dir.display(),
        match_threshold = config.pipeline.match_threshold,
        vote_neighbors = ?config.pipeline.vote_neighbors,
        "configuration loaded"
    );

    let ledger = Arc::new(AttendanceLedger::new());
    let engine = engine::spawn_engine(&config, Arc::clone(&ledger))
        .context("loading recognition models")?;

    let service = PresenceService::new(engine, ledger, config.max_upload_bytes);

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
