mod config;
mod context;
mod error;
mod routes;
mod supervisor;
mod ws;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::ServerConfig;

#[derive(Parser)]
#[command(name = "conductor", about = "Orchestration engine for fleets of LLM coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file with a fresh callback secret (no server started)
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the orchestration engine (default)
    Serve {
        /// HTTP port (overrides WEB_PORT and the config file)
        #[arg(long)]
        port: Option<u16>,
        /// Data directory (overrides DATA_DIR and the config file)
        #[arg(long)]
        data_dir: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Init { force }) => config::run_init(force),
        Some(Commands::Serve { port, data_dir }) => {
            let mut config = ServerConfig::load()?;
            if let Some(port) = port {
                config.web_port = port;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            supervisor::run(config).await
        }
        None => supervisor::run(ServerConfig::load()?).await,
    }
}
