//! Node mode: scheduler candidate, worker agent, and task control API.
//!
//! In this mode, the daemon:
//! 1. Opens the embedded store, or connects to remote store endpoints
//! 2. Campaigns for scheduler leadership (unless disabled)
//! 3. Registers as a worker for its strategy kinds (if any)
//! 4. Serves the REST API until Ctrl-C / SIGTERM
//! 5. On shutdown, closes local supervisors and deregisters

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use strat_core::NodeConfig;
use stratgrid_agent::WorkerAgent;
use stratgrid_rpc::RemoteStore;
use stratgrid_scheduler::{Scheduler, TaskControl};
use stratgrid_store::{EmbeddedStore, SharedStore};
use stratgrid_supervisor::{RunnerLauncher, SupervisorContext};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// How often the embedded store expires leases.
pub const LEASE_REAP_INTERVAL: Duration = Duration::from_millis(500);

/// Connect timeout for remote store endpoints.
const STORE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run_node(config: NodeConfig, port: u16) -> anyhow::Result<()> {
    info!("StratGrid daemon starting in node mode");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    // ── Coordination store ───────────────────────────────────────
    let store: SharedStore = if config.store.endpoints.is_empty() {
        std::fs::create_dir_all(&config.store.data_dir)?;
        let path = config.store.data_dir.join("stratgrid.redb");
        let embedded = EmbeddedStore::open(&path)?;
        info!(path = %path.display(), "embedded coordination store opened");

        let reaper = embedded.clone();
        let reaper_shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            reaper.run_lease_reaper(LEASE_REAP_INTERVAL, reaper_shutdown).await;
        }));
        Arc::new(embedded)
    } else {
        let remote = RemoteStore::connect(&config.store.endpoints, STORE_CONNECT_TIMEOUT)?;
        info!(endpoints = ?config.store.endpoints, "using remote coordination store");
        Arc::new(remote)
    };

    let node = config.advertise_address(port);

    // ── Scheduler ────────────────────────────────────────────────
    if config.scheduler.enabled {
        let scheduler = Scheduler::new(store.clone(), &config.scheduler);
        info!(identity = scheduler.identity(), "scheduler candidate started");
        let scheduler_shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            scheduler.run(scheduler_shutdown).await;
        }));
    }

    // ── Worker agent ─────────────────────────────────────────────
    let agent = if config.node.strategy_kinds.is_empty() {
        info!("no strategy kinds configured, not running tasks");
        None
    } else {
        std::fs::create_dir_all(&config.node.socket_dir)?;
        let ctx = SupervisorContext {
            store: store.clone(),
            launcher: Arc::new(RunnerLauncher::from_config(&config.supervisor)?),
            node: node.clone(),
            socket_dir: config.node.socket_dir.clone(),
            config: config.supervisor.clone(),
        };
        let agent = WorkerAgent::new(ctx, config.node.strategy_kinds.clone(), &config.agent);
        info!(%node, kinds = ?config.node.strategy_kinds, "worker agent started");

        let runner = agent.clone();
        let agent_shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            runner.run(agent_shutdown).await;
        }));
        Some(agent)
    };

    // ── REST API ─────────────────────────────────────────────────
    let control = TaskControl::new(store, config.scheduler.op_timeout());
    let router = stratgrid_api::build_router(control, agent);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, %node, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            crate::shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for handle in background {
        let _ = handle.await;
    }
    info!("node stopped");
    Ok(())
}
