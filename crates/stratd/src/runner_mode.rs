//! Runner mode: the child side of a supervisor's control channel.

use std::path::PathBuf;
use std::sync::Arc;

use stratgrid_supervisor::{ControlServer, RecordingHost};
use tokio::sync::watch;
use tracing::info;

pub async fn run_runner(endpoint: PathBuf) -> anyhow::Result<()> {
    info!(endpoint = %endpoint.display(), pid = std::process::id(), "strategy runner starting");
    let server = ControlServer::bind(&endpoint)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        crate::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    server.serve(Arc::new(RecordingHost::default()), shutdown_rx).await?;
    info!("strategy runner stopped");
    Ok(())
}
