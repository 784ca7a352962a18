//! Run the scheduler daemon.

use super::app::App;
use super::config::SalternConfig;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. `RUST_LOG` overrides the
/// configured level. Safe to call once per process; later calls are no-ops.
pub fn init_tracing(level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

/// Start the long-running service: bootstrap an empty catalog, then drive
/// the three jobs on their configured intervals until the process stops.
pub async fn execute(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = SalternConfig::load(config_path)?;
    init_tracing(&config.logging.level);

    let intervals = config.schedule.intervals()?;
    let app = App::build(config).await?;

    println!("Starting saltern scheduler");
    println!("Config: {}", config_path.display());
    println!("Database: {}", app.config.storage.database.display());

    let scheduler = app.scheduler(intervals)?;
    scheduler.run().await?;
    Ok(())
}
