//! Store mode: serves the embedded coordination store over gRPC.

use std::net::SocketAddr;
use std::sync::Arc;

use strat_core::NodeConfig;
use stratgrid_store::EmbeddedStore;
use tokio::sync::watch;
use tracing::info;

use crate::node_mode::LEASE_REAP_INTERVAL;

pub async fn run_store(config: NodeConfig, listen: SocketAddr) -> anyhow::Result<()> {
    info!("StratGrid daemon starting in store mode");
    std::fs::create_dir_all(&config.store.data_dir)?;
    let path = config.store.data_dir.join("stratgrid.redb");
    let store = EmbeddedStore::open(&path)?;
    info!(path = %path.display(), revision = store.revision(), "coordination store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = store.clone();
    let reaper_handle = tokio::spawn(async move {
        reaper.run_lease_reaper(LEASE_REAP_INTERVAL, shutdown_rx).await;
    });

    stratgrid_rpc::serve(Arc::new(store), listen, async move {
        crate::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    })
    .await?;

    let _ = reaper_handle.await;
    info!("store stopped");
    Ok(())
}
