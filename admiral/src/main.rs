use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use admiral::{
    app,
    config::{self, Config, WatcherKind},
};

/// A controller relaying cluster telemetry to pluggable backends.
#[derive(Parser)]
#[command(name = "admiral", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'f', long = "file", global = true, value_name = "PATH")]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Without a subcommand, every watcher in the configuration is started.
#[derive(Subcommand)]
enum Command {
    /// Stream container logs to a backend.
    Logs,
    /// Stream filtered cluster events to a backend.
    Events,
    /// Stream resource metrics to a backend.
    Metrics,
    /// Run performance probes against the configured target.
    Performance,
}

impl Command {
    fn kind(&self) -> WatcherKind {
        match self {
            Command::Logs => WatcherKind::Logs,
            Command::Events => WatcherKind::Events,
            Command::Metrics => WatcherKind::Metrics,
            Command::Performance => WatcherKind::Performance,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let path = config::config_path(cli.file.as_deref());
    let config = Config::load(&path)?;
    let only = cli.command.as_ref().map(Command::kind);

    info!(cluster = %config.cluster, config = %path.display(), "admiral starting");

    let token = CancellationToken::new();
    tokio::spawn(app::shutdown_signal(token.clone()));
    app::run(config, only, token).await?;

    info!("admiral stopped");
    Ok(())
}
