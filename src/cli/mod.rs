use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod app;
pub mod config;
pub mod run;

use self::app::App;
use self::config::SalternConfig;

#[derive(Parser)]
#[command(name = "saltern")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Identifier-privacy service: pepper rotation, hash catalog, federation sync",
    long_about = None
)]
pub struct Cli {
    /// Path to the configuration file (defaults to the platform data dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a commented default configuration file
    Init {
        /// Path for the SQLite database recorded in the generated config
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Run the scheduler daemon (rotation, incremental sync, federation)
    Run,

    /// Run one pepper rotation cycle and exit
    Rotate,

    /// Run one incremental user sync cycle and exit
    Sync,

    /// Run one federation push cycle and exit
    Federate,

    /// Print a catalog and pepper summary
    Status,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    match cli.command {
        Commands::Init { database } => {
            let database = database.unwrap_or_else(config::default_database_path);
            SalternConfig::create_default(&config_path, &database)?;
            println!("Created: {}", config_path.display());
            Ok(())
        }
        Commands::Run => run::execute(&config_path).await,
        Commands::Rotate => with_app(&config_path, |app| async move { app.rotate_once().await })
            .await,
        Commands::Sync => with_app(&config_path, |app| async move { app.sync_once().await }).await,
        Commands::Federate => {
            with_app(&config_path, |app| async move { app.federate_once().await }).await
        }
        Commands::Status => with_app(&config_path, |app| async move { app.status().await }).await,
    }
}

async fn with_app<F, Fut>(
    config_path: &std::path::Path,
    command: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(App) -> Fut,
    Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error>>>,
{
    let config = SalternConfig::load(config_path)?;
    run::init_tracing(&config.logging.level);
    let app = App::build(config).await?;
    command(app).await
}
