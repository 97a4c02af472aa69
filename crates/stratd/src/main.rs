//! stratd: the StratGrid daemon.
//!
//! Single binary with three roles:
//! - `store`: the coordination store served over gRPC
//! - `node`: scheduler candidate, worker agent, and task control API
//! - `runner`: the child process a supervisor spawns for one task
//!
//! # Usage
//!
//! ```text
//! stratd --config /etc/stratgrid/node.toml store --listen 0.0.0.0:7400
//! stratd --config /etc/stratgrid/node.toml node --port 7000
//! stratd runner --endpoint /tmp/stratgrid/strat-<id>.sock
//! ```

mod node_mode;
mod runner_mode;
mod store_mode;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use strat_core::NodeConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "stratd", about = "StratGrid daemon")]
struct Cli {
    /// Node configuration file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the coordination store.
    Store {
        /// Address for the gRPC listener.
        #[arg(long, default_value = "0.0.0.0:7400")]
        listen: SocketAddr,
    },
    /// Run a scheduler/worker node with the task control API.
    Node {
        /// Port for the HTTP API.
        #[arg(long, default_value = "7000")]
        port: u16,
    },
    /// Host one strategy behind a control channel (spawned by supervisors).
    Runner {
        /// Unix socket path of the control channel.
        #[arg(long)]
        endpoint: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stratd=debug,stratgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<NodeConfig> {
    match path {
        Some(path) => {
            let config = NodeConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(NodeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Store { listen } => {
            let config = load_config(cli.config.as_ref())?;
            store_mode::run_store(config, listen).await
        }
        Command::Node { port } => {
            let config = load_config(cli.config.as_ref())?;
            node_mode::run_node(config, port).await
        }
        Command::Runner { endpoint } => runner_mode::run_runner(endpoint).await,
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
