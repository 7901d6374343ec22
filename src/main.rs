use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

use plan_runner::config::RunnerConfig;

#[derive(Parser)]
#[command(name = "plan-runner")]
#[command(version, about = "Resumable execution engine for human-supervised agent plans")]
pub struct Cli {
    /// Path to config.toml (defaults to .plan-runner/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path. Overrides [storage] db_path.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP/SSE/WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (CORS permissive, bind 0.0.0.0)
        #[arg(long)]
        dev: bool,
    },
    /// Create the execution database and exit
    InitDb,
    /// Show the latest run recorded for a session
    Status { session_id: String },
    /// View, validate or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default config.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(RunnerConfig::default_path);
    let mut config = match cmd::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        // `config init` must still work when the existing file is broken
        Err(e)
            if matches!(
                cli.command,
                Commands::Config {
                    command: Some(ConfigCommands::Init)
                }
            ) =>
        {
            eprintln!("Warning: {:#}", e);
            RunnerConfig::default()
        }
        Err(e) => return Err(e),
    };
    cmd::override_db_path(&mut config, cli.db_path.as_ref());

    plan_runner::logging::init(cli.log_json || config.logging.json);

    match cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(config, cmd::serve::ServeOverrides { host, port, dev }).await?
        }
        Commands::InitDb => cmd::cmd_init_db(&config.storage.db_path)?,
        Commands::Status { session_id } => cmd::cmd_status(&config.storage.db_path, &session_id)?,
        Commands::Config { command } => cmd::cmd_config(&config, &config_path, command)?,
    }

    Ok(())
}
