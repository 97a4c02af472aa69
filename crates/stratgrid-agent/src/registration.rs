//! Worker registration: advertises which strategy kinds this node runs.
//!
//! All of a node's registrations share one lease. When the lease is lost
//! (expired, revoked, or refresh failing for a full TTL) the node
//! registers again under a fresh one.

use std::time::Duration;

use strat_core::keys;
use strat_core::{NodeAddr, StrategyKind, WorkerRegistration, epoch_secs};
use stratgrid_store::{LeaseKeeper, SharedStore, StoreError, StoreResult, put_json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Delay between failed registration attempts.
const REGISTER_RETRY: Duration = Duration::from_secs(1);

/// Register `kinds` for `node` and keep them registered until `shutdown`
/// fires, then remove them.
pub async fn maintain(
    store: SharedStore,
    node: NodeAddr,
    kinds: Vec<StrategyKind>,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match register(&store, &node, &kinds, ttl).await {
            Ok(keeper) => {
                info!(%node, kinds = ?kinds, lease = keeper.lease(), "worker registered");
                tokio::select! {
                    _ = keeper.lost() => {
                        warn!(%node, "registration lease lost, re-registering");
                    }
                    _ = shutdown.changed() => {
                        deregister(&store, &node, keeper).await;
                        return;
                    }
                }
            }
            Err(e) => warn!(%node, error = %e, "worker registration failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(REGISTER_RETRY) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn register(
    store: &SharedStore,
    node: &str,
    kinds: &[StrategyKind],
    ttl: Duration,
) -> StoreResult<LeaseKeeper> {
    let lease = store.grant_lease(ttl).await?;
    for kind in kinds {
        let record = WorkerRegistration {
            node: node.to_string(),
            strategy_kind: kind.clone(),
            registered_at: epoch_secs(),
        };
        let key = keys::worker_registration(kind, node);
        if let Err(e) = put_json(store.as_ref(), &key, &record, Some(lease)).await {
            let _ = store.revoke_lease(lease).await;
            return Err(e);
        }
    }
    Ok(LeaseKeeper::spawn(store.clone(), lease, ttl))
}

async fn deregister(store: &SharedStore, node: &str, keeper: LeaseKeeper) {
    let lease = keeper.lease();
    keeper.stop().await;
    match store.revoke_lease(lease).await {
        Ok(()) => info!(%node, "worker deregistered"),
        Err(StoreError::LeaseNotFound(_)) => debug!(%node, "registration lease already gone"),
        Err(e) => warn!(%node, error = %e, "failed to deregister worker"),
    }
}
