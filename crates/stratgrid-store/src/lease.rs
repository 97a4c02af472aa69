//! Background lease keep-alive.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::SharedStore;
use crate::types::LeaseId;

/// Keep-alive cadence for a lease TTL: a third of it, never below 100ms.
pub fn keep_alive_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(100))
}

/// Keeps one lease alive until stopped or until the lease is lost.
///
/// The lease counts as lost when the store reports it unknown, or when no
/// refresh has succeeded for a full TTL.
pub struct LeaseKeeper {
    lease: LeaseId,
    stop: watch::Sender<bool>,
    lost: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl LeaseKeeper {
    pub fn spawn(store: SharedStore, lease: LeaseId, ttl: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (lost_tx, lost_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Some(e) = keep_alive_loop(store, lease, ttl, stop_rx).await {
                warn!(lease, error = %e, "lease lost");
                let _ = lost_tx.send(true);
            }
        });
        Self {
            lease,
            stop: stop_tx,
            lost: lost_rx,
            task,
        }
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves once the lease is lost. Never resolves after [`stop`](Self::stop).
    pub async fn lost(&self) {
        let mut lost = self.lost.clone();
        if lost.wait_for(|lost| *lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Stop refreshing. The lease itself is left to expire or be revoked.
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        let _ = (&mut self.task).await;
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// Refresh `lease` until `stop` fires or the lease is lost. Returns the
/// error that ended the loop, or `None` when stopped.
pub async fn keep_alive_loop(
    store: SharedStore,
    lease: LeaseId,
    ttl: Duration,
    mut stop: watch::Receiver<bool>,
) -> Option<StoreError> {
    let mut ticker = tokio::time::interval(keep_alive_interval(ttl));
    let mut last_ok = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.keep_alive(lease).await {
                    Ok(()) => last_ok = Instant::now(),
                    Err(e @ StoreError::LeaseNotFound(_)) => return Some(e),
                    Err(e) if last_ok.elapsed() >= ttl => return Some(e),
                    Err(e) => warn!(lease, error = %e, "lease keep-alive failed, retrying"),
                }
            }
            _ = stop.changed() => {
                debug!(lease, "lease keep-alive stopped");
                return None;
            }
        }
    }
}
