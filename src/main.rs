use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use nimbus::config::NimbusConfig;
use nimbus::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(version, about = "Cluster lifecycle orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to nimbus.toml. Defaults to $NIMBUS_CONFIG, then .nimbus/nimbus.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator API server
    Serve {
        /// Address to listen on (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,

        /// Dev mode: in-memory store, simulated providers, permissive CORS
        #[arg(long)]
        dev: bool,

        /// Keep cluster records in memory only
        #[arg(long)]
        memory: bool,
    },
    /// Create and migrate the SQLite cluster store
    InitDb {
        /// Database path (overrides store.path)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default nimbus.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config_path, config) = NimbusConfig::resolve(cli.config.as_deref())?;
    let _log_guard = logging::init_tracing(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve { bind, dev, memory } => {
            cmd::cmd_serve(config, bind.clone(), *dev, *memory).await?;
        }
        Commands::InitDb { db_path } => cmd::cmd_init_db(&config, db_path.clone())?,
        Commands::Config { command } => cmd::cmd_config(&config_path, &config, command.clone())?,
    }

    Ok(())
}
