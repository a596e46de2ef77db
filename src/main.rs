use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tungo::device::NativeConfigurator;
use tungo::{ClientSettings, ServerSettings};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Log filter, e.g. "info" or "tungo=debug"
    #[arg(long, default_value = "info")]
    log_filter: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Connect out to a server and keep the tunnel alive
    Client {
        /// Path to the JSON client configuration
        #[arg(long)]
        config: PathBuf,
    },
    /// Listen for clients
    Server {
        /// Path to the JSON server configuration
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let root = CancellationToken::new();
    {
        let root = root.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                root.cancel();
            }
        });
    }

    let configurator = NativeConfigurator;
    match cli.mode {
        Mode::Client { config } => {
            let raw = std::fs::read_to_string(&config)
                .with_context(|| format!("reading {}", config.display()))?;
            let settings: ClientSettings =
                serde_json::from_str(&raw).context("parsing client configuration")?;
            tungo::client::run(settings, &configurator, root).await
        }
        Mode::Server { config } => {
            let raw = std::fs::read_to_string(&config)
                .with_context(|| format!("reading {}", config.display()))?;
            let settings: ServerSettings =
                serde_json::from_str(&raw).context("parsing server configuration")?;
            tungo::server::run(settings, &configurator, root).await
        }
    }
}
