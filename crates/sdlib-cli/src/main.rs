//! sdlib command-line entry point.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sdlib_axum::{serve, ServerConfig};

#[derive(Parser)]
#[command(name = "sdlib", about = "Local control plane for diffusion engines", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value_t = 9410, env = "SDLIB_PORT")]
        port: u16,

        /// Path to the models config document.
        #[arg(long, default_value = "models.json", env = "SDLIB_CONFIG")]
        config: PathBuf,

        /// Path to the SQLite database.
        #[arg(long, default_value = "sdlib.db", env = "SDLIB_DB")]
        db: PathBuf,

        /// Data directory for uploads, outputs, and downloaded models.
        #[arg(long, default_value = "data", env = "SDLIB_DATA_DIR")]
        data_dir: PathBuf,

        /// Processor poll interval in milliseconds.
        #[arg(long, env = "SDLIB_POLL_INTERVAL_MS")]
        poll_interval_ms: Option<u64>,

        /// Registry token for gated repositories.
        #[arg(long, env = "SDLIB_HF_TOKEN")]
        hf_token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            port,
            config,
            db,
            data_dir,
            poll_interval_ms,
            hf_token,
        } => {
            serve(ServerConfig {
                port,
                config_path: config,
                db_path: db,
                data_dir,
                poll_interval: poll_interval_ms.map(Duration::from_millis),
                hf_token,
            })
            .await
        }
    }
}
