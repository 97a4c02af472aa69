//! Leader election on top of the coordination store.
//!
//! A candidate grants itself a lease and tries to create `election/{name}`
//! bound to it. Whoever creates the key is leader until the key disappears,
//! which happens when the leader resigns (revokes its lease) or stops
//! refreshing the lease. Losers watch the key and retry on delete.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::lease::LeaseKeeper;
use crate::store::SharedStore;
use crate::types::{KeyValue, LeaseId, WatchEvent};

/// Delay before an observer re-subscribes after its feed broke.
const OBSERVE_RETRY: Duration = Duration::from_millis(500);

/// A named election.
#[derive(Clone)]
pub struct Election {
    store: SharedStore,
    key: String,
    lease_ttl: Duration,
}

impl Election {
    pub fn new(store: SharedStore, name: &str, lease_ttl: Duration) -> Self {
        Self {
            store,
            key: format!("election/{name}"),
            lease_ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until `identity` becomes leader.
    ///
    /// Dropping the returned future abandons the campaign; its lease then
    /// expires on its own.
    pub async fn campaign(&self, identity: &str) -> StoreResult<Leadership> {
        let lease = self.store.grant_lease(self.lease_ttl).await?;
        let keeper = LeaseKeeper::spawn(self.store.clone(), lease, self.lease_ttl);

        match self.contend(identity, &keeper).await {
            Ok(()) => {
                info!(election = %self.key, %identity, lease, "won election");
                Ok(Leadership {
                    identity: identity.to_string(),
                    lease,
                    store: self.store.clone(),
                    keeper,
                })
            }
            Err(e) => {
                keeper.stop().await;
                let _ = self.store.revoke_lease(lease).await;
                Err(e)
            }
        }
    }

    async fn contend(&self, identity: &str, keeper: &LeaseKeeper) -> StoreResult<()> {
        let lease = keeper.lease();
        loop {
            // Subscribe first so a delete between create and watch is not missed.
            let mut feed = self.store.watch(&self.key).await?;
            if self
                .store
                .create(&self.key, identity.as_bytes().to_vec(), Some(lease))
                .await?
            {
                return Ok(());
            }
            debug!(election = %self.key, %identity, "leader present, waiting");

            loop {
                tokio::select! {
                    event = feed.recv() => match event {
                        Some(Ok(WatchEvent::Delete { ref key, .. })) if *key == self.key => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(election = %self.key, error = %e, "election watch broken, retrying");
                            break;
                        }
                        None => break,
                    },
                    _ = keeper.lost() => return Err(StoreError::LeaseNotFound(lease)),
                }
            }
        }
    }

    /// Current leader identity, read once.
    pub async fn leader(&self) -> StoreResult<Option<String>> {
        Ok(self.store.get(&self.key).await?.as_ref().map(identity_of))
    }

    /// Follow the leader identity. Publishes `None` while there is no
    /// leader and while the feed is being re-established.
    ///
    /// The background task ends when every receiver is dropped.
    pub fn observe(&self) -> watch::Receiver<Option<String>> {
        let (tx, rx) = watch::channel(None);
        let election = self.clone();

        tokio::spawn(async move {
            loop {
                if let Err(e) = election.follow(&tx).await {
                    warn!(election = %election.key, error = %e, "leader observer lost its feed");
                }
                publish(&tx, None);
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(OBSERVE_RETRY) => {}
                }
            }
        });

        rx
    }

    async fn follow(&self, tx: &watch::Sender<Option<String>>) -> StoreResult<()> {
        let mut feed = self.store.watch(&self.key).await?;
        publish(tx, self.leader().await?);

        loop {
            tokio::select! {
                event = feed.recv() => match event {
                    Some(Ok(event)) if event.key() != self.key => {}
                    Some(Ok(WatchEvent::Put(kv))) => publish(tx, Some(identity_of(&kv))),
                    Some(Ok(WatchEvent::Delete { .. })) => publish(tx, None),
                    Some(Err(e)) => return Err(e),
                    None => return Err(StoreError::Unavailable("election watch closed".into())),
                },
                _ = tx.closed() => return Ok(()),
            }
        }
    }
}

/// Held by the elected leader.
pub struct Leadership {
    identity: String,
    lease: LeaseId,
    store: SharedStore,
    keeper: LeaseKeeper,
}

impl Leadership {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Resolves when the leadership lease is lost.
    pub async fn lost(&self) {
        self.keeper.lost().await
    }

    /// Step down by revoking the lease, which deletes the election key.
    pub async fn resign(self) -> StoreResult<()> {
        self.keeper.stop().await;
        match self.store.revoke_lease(self.lease).await {
            Ok(()) | Err(StoreError::LeaseNotFound(_)) => {
                info!(identity = %self.identity, "resigned leadership");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn identity_of(kv: &KeyValue) -> String {
    String::from_utf8_lossy(&kv.value).into_owned()
}

fn publish(tx: &watch::Sender<Option<String>>, leader: Option<String>) {
    tx.send_if_modified(|current| {
        if *current == leader {
            false
        } else {
            *current = leader;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::embedded::EmbeddedStore;

    const TTL: Duration = Duration::from_secs(5);

    fn shared() -> SharedStore {
        Arc::new(EmbeddedStore::open_in_memory().unwrap())
    }

    async fn wait_for_leader(
        rx: &mut watch::Receiver<Option<String>>,
        expected: Option<&str>,
    ) {
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|leader| leader.as_deref() == expected),
        )
        .await
        .expect("leader observed in time")
        .expect("observer alive");
    }

    #[tokio::test]
    async fn single_candidate_wins() {
        let store = shared();
        let election = Election::new(store, "scheduler", TTL);
        let mut observer = election.observe();

        let leadership = election.campaign("node-a").await.unwrap();
        assert_eq!(leadership.identity(), "node-a");
        assert_eq!(election.leader().await.unwrap().as_deref(), Some("node-a"));
        wait_for_leader(&mut observer, Some("node-a")).await;
    }

    #[tokio::test]
    async fn second_candidate_waits_for_resignation() {
        let store = shared();
        let a = Election::new(store.clone(), "scheduler", TTL);
        let b = Election::new(store, "scheduler", TTL);
        let mut observer = a.observe();

        let leadership = a.campaign("node-a").await.unwrap();
        let contender = tokio::spawn(async move { b.campaign("node-b").await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!contender.is_finished());
        wait_for_leader(&mut observer, Some("node-a")).await;

        leadership.resign().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), contender)
            .await
            .expect("second candidate elected")
            .unwrap()
            .unwrap();
        assert_eq!(second.identity(), "node-b");
        wait_for_leader(&mut observer, Some("node-b")).await;
    }

    #[tokio::test]
    async fn revoked_lease_ends_leadership() {
        let store = shared();
        let election = Election::new(store.clone(), "scheduler", TTL);
        let mut observer = election.observe();

        let leadership = election.campaign("node-a").await.unwrap();
        wait_for_leader(&mut observer, Some("node-a")).await;

        store.revoke_lease(leadership.lease()).await.unwrap();
        wait_for_leader(&mut observer, None).await;
        tokio::time::timeout(Duration::from_secs(5), leadership.lost())
            .await
            .expect("loss detected");
    }

    #[tokio::test]
    async fn separate_names_do_not_contend() {
        let store = shared();
        let one = Election::new(store.clone(), "scheduler", TTL);
        let two = Election::new(store, "scheduler-grid", TTL);

        let _a = one.campaign("node-a").await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), two.campaign("node-b"))
            .await
            .expect("independent election")
            .unwrap();
        assert_eq!(b.identity(), "node-b");
    }
}
