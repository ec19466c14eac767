use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{Bus, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        dataset = %config.dataset_dir.display(),
        students = %config.student_db.display(),
        log = %config.attendance_log.display(),
        sample_every = config.sample_every,
        flush_every_ticks = config.flush_every_ticks,
        policy = ?config.marking_policy,
        "configuration loaded"
    );

    let bus = config.bus;
    let engine = engine::spawn_engine(config).context("failed to start engine")?;
    let service = AttendanceService::new(engine.clone());

    let builder = match bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, ?bus, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    match engine.stop().await {
        Ok(summary) => tracing::info!(
            session = %summary.session_id,
            present = summary.present_count,
            total = summary.total_roster_count,
            "final session summary"
        ),
        Err(engine::EngineError::NotRunning) => {}
        Err(e) => tracing::warn!(error = %e, "failed to stop session cleanly"),
    }

    Ok(())
}
