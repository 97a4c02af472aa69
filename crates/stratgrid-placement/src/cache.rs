//! Node registry cache.
//!
//! A single actor mirrors `worker-registration/` and `node-load/` from the
//! store. It loads a full snapshot of both prefixes, then applies the watch
//! feeds incrementally, publishing each new state as an immutable
//! [`NodeSnapshot`] over a `watch` channel. While a snapshot is being
//! (re)loaded the published value is `None`, so readers never see a
//! partially loaded cache.
//!
//! The cache lags the store. The scheduler sends local hints after its own
//! writes so back-to-back placements see the load they just added.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use strat_core::keys::{self, NODE_LOAD_PREFIX, WORKER_REGISTRATION_PREFIX};
use strat_core::{NodeAddr, NodeLoadRecord, StrategyKind, TaskKey};
use stratgrid_store::{KeyValue, Revision, SharedStore, StoreError, StoreResult, WatchEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PlacementError, PlacementResult};

/// Pause before reloading after the watch feed broke.
const RELOAD_DELAY: Duration = Duration::from_millis(500);

const HINT_BUFFER: usize = 64;

/// Immutable view of registered workers and their task load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSnapshot {
    registered: BTreeMap<StrategyKind, BTreeSet<NodeAddr>>,
    loads: BTreeMap<StrategyKind, BTreeMap<NodeAddr, BTreeSet<TaskKey>>>,
    registration_revision: Revision,
}

impl NodeSnapshot {
    /// Registered nodes for a strategy kind, in cache order.
    pub fn nodes_for<'a>(&'a self, strategy_kind: &str) -> impl Iterator<Item = &'a NodeAddr> + 'a {
        self.registered.get(strategy_kind).into_iter().flatten()
    }

    pub fn is_registered(&self, strategy_kind: &str, node: &str) -> bool {
        self.registered
            .get(strategy_kind)
            .is_some_and(|nodes| nodes.contains(node))
    }

    /// Number of tasks attributed to `node`; zero without a load record.
    pub fn load_of(&self, strategy_kind: &str, node: &str) -> usize {
        self.tasks_on(strategy_kind, node).map_or(0, BTreeSet::len)
    }

    pub fn tasks_on(&self, strategy_kind: &str, node: &str) -> Option<&BTreeSet<TaskKey>> {
        self.loads.get(strategy_kind)?.get(node)
    }

    /// Every `(strategy_kind, node)` that has a load record.
    pub fn load_records(&self) -> impl Iterator<Item = (&str, &str, &BTreeSet<TaskKey>)> {
        self.loads.iter().flat_map(|(kind, nodes)| {
            nodes
                .iter()
                .map(move |(node, tasks)| (kind.as_str(), node.as_str(), tasks))
        })
    }

    pub fn node_count(&self) -> usize {
        self.registered.values().map(BTreeSet::len).sum()
    }

    /// Store revision up to which registration changes are reflected.
    pub fn registration_revision(&self) -> Revision {
        self.registration_revision
    }

    fn apply_put(&mut self, kv: &KeyValue) {
        if let Some((kind, node)) = keys::kind_and_node(WORKER_REGISTRATION_PREFIX, &kv.key) {
            self.registered
                .entry(kind.to_string())
                .or_default()
                .insert(node.to_string());
        } else if let Some((kind, node)) = keys::kind_and_node(NODE_LOAD_PREFIX, &kv.key) {
            match kv.decode::<NodeLoadRecord>() {
                Ok(record) => {
                    self.loads
                        .entry(kind.to_string())
                        .or_default()
                        .insert(node.to_string(), record.tasks);
                }
                Err(e) => warn!(key = %kv.key, error = %e, "skipping unreadable node-load record"),
            }
        }
    }

    fn apply_delete(&mut self, key: &str) {
        if let Some((kind, node)) = keys::kind_and_node(WORKER_REGISTRATION_PREFIX, key) {
            if let Some(nodes) = self.registered.get_mut(kind) {
                nodes.remove(node);
                if nodes.is_empty() {
                    self.registered.remove(kind);
                }
            }
        } else if let Some((kind, node)) = keys::kind_and_node(NODE_LOAD_PREFIX, key) {
            if let Some(nodes) = self.loads.get_mut(kind) {
                nodes.remove(node);
                if nodes.is_empty() {
                    self.loads.remove(kind);
                }
            }
        }
    }

    fn apply_hint(&mut self, hint: &Hint) {
        match hint {
            Hint::Placed { strategy_kind, node, task_key } => {
                self.loads
                    .entry(strategy_kind.clone())
                    .or_default()
                    .entry(node.clone())
                    .or_default()
                    .insert(task_key.clone());
            }
            Hint::Removed { strategy_kind, node, task_key } => {
                if let Some(tasks) = self
                    .loads
                    .get_mut(strategy_kind)
                    .and_then(|nodes| nodes.get_mut(node))
                {
                    tasks.remove(task_key);
                }
            }
            // The registration itself follows the store; a newer one may
            // already be applied.
            Hint::Offline { strategy_kind, node } => {
                self.apply_delete(&keys::node_load(strategy_kind, node));
            }
        }
    }
}

#[derive(Debug)]
enum Hint {
    Placed {
        strategy_kind: StrategyKind,
        node: NodeAddr,
        task_key: TaskKey,
    },
    Removed {
        strategy_kind: StrategyKind,
        node: NodeAddr,
        task_key: TaskKey,
    },
    Offline {
        strategy_kind: StrategyKind,
        node: NodeAddr,
    },
}

/// Handle to the cache actor. Cheap to clone.
#[derive(Clone)]
pub struct NodeCache {
    feed: watch::Receiver<Option<Arc<NodeSnapshot>>>,
    hints: mpsc::Sender<(Hint, oneshot::Sender<()>)>,
}

impl NodeCache {
    /// Start the cache actor. It runs until `shutdown` fires or every handle
    /// is dropped.
    pub fn spawn(store: SharedStore, shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let (feed_tx, feed_rx) = watch::channel(None);
        let (hint_tx, hint_rx) = mpsc::channel(HINT_BUFFER);

        let actor = CacheActor {
            store,
            feed: feed_tx,
            hints: hint_rx,
            snapshot: NodeSnapshot::default(),
        };
        let handle = tokio::spawn(actor.run(shutdown));

        (
            Self {
                feed: feed_rx,
                hints: hint_tx,
            },
            handle,
        )
    }

    /// Latest snapshot, or `None` while a load is in progress.
    pub fn snapshot(&self) -> Option<Arc<NodeSnapshot>> {
        self.feed.borrow().clone()
    }

    /// Wait for a fully loaded snapshot.
    pub async fn ready(&self) -> PlacementResult<Arc<NodeSnapshot>> {
        let mut feed = self.feed.clone();
        let current = feed
            .wait_for(Option::is_some)
            .await
            .map_err(|_| PlacementError::CacheClosed)?
            .clone();
        current.ok_or(PlacementError::CacheClosed)
    }

    /// Wait for a loaded snapshot that reflects every registration change
    /// up to `revision`.
    pub async fn ready_at(&self, revision: Revision) -> PlacementResult<Arc<NodeSnapshot>> {
        let mut feed = self.feed.clone();
        let current = feed
            .wait_for(|snapshot| {
                snapshot
                    .as_ref()
                    .is_some_and(|s| s.registration_revision >= revision)
            })
            .await
            .map_err(|_| PlacementError::CacheClosed)?
            .clone();
        current.ok_or(PlacementError::CacheClosed)
    }

    /// Follow snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<NodeSnapshot>>> {
        self.feed.clone()
    }

    /// Record a placement this process just wrote.
    pub async fn note_placed(&self, strategy_kind: &str, node: &str, task_key: &TaskKey) {
        self.hint(Hint::Placed {
            strategy_kind: strategy_kind.to_string(),
            node: node.to_string(),
            task_key: task_key.clone(),
        })
        .await;
    }

    /// Record a removal this process just wrote.
    pub async fn note_removed(&self, strategy_kind: &str, node: &str, task_key: &TaskKey) {
        self.hint(Hint::Removed {
            strategy_kind: strategy_kind.to_string(),
            node: node.to_string(),
            task_key: task_key.clone(),
        })
        .await;
    }

    /// Forget the load of a node this process just declared offline.
    pub async fn note_offline(&self, strategy_kind: &str, node: &str) {
        self.hint(Hint::Offline {
            strategy_kind: strategy_kind.to_string(),
            node: node.to_string(),
        })
        .await;
    }

    /// Send a hint and wait until the next published snapshot includes it.
    async fn hint(&self, hint: Hint) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.hints.send((hint, ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct CacheActor {
    store: SharedStore,
    feed: watch::Sender<Option<Arc<NodeSnapshot>>>,
    hints: mpsc::Receiver<(Hint, oneshot::Sender<()>)>,
    snapshot: NodeSnapshot,
}

impl CacheActor {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            // Discard the old state before reloading.
            self.feed.send_replace(None);
            self.snapshot = NodeSnapshot::default();

            let outcome = tokio::select! {
                result = self.sync() => result,
                _ = shutdown.changed() => break,
            };

            match outcome {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, "node cache lost its feed, reloading");
                    tokio::select! {
                        _ = tokio::time::sleep(RELOAD_DELAY) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        self.feed.send_replace(None);
        debug!("node cache stopped");
    }

    /// Load a snapshot and follow the feeds. Returns `Ok` only when every
    /// handle is gone.
    async fn sync(&mut self) -> StoreResult<()> {
        // Watch before reading so nothing between the two is lost.
        let mut registrations = self.store.watch(WORKER_REGISTRATION_PREFIX).await?;
        let mut loads = self.store.watch(NODE_LOAD_PREFIX).await?;

        let registered = self.store.range(WORKER_REGISTRATION_PREFIX).await?;
        let loaded = self.store.range(NODE_LOAD_PREFIX).await?;
        for kv in registered.kvs.iter().chain(loaded.kvs.iter()) {
            self.snapshot.apply_put(kv);
        }
        self.snapshot.registration_revision = registered.revision;
        self.publish();
        info!(
            nodes = self.snapshot.node_count(),
            revision = loaded.revision.max(registered.revision),
            "node cache loaded"
        );

        loop {
            tokio::select! {
                event = registrations.recv() => {
                    let revision = self.apply_event(event, registered.revision)?;
                    if revision > self.snapshot.registration_revision {
                        self.snapshot.registration_revision = revision;
                        self.publish();
                    }
                }
                event = loads.recv() => {
                    self.apply_event(event, loaded.revision)?;
                }
                hint = self.hints.recv() => match hint {
                    Some((hint, ack)) => {
                        self.snapshot.apply_hint(&hint);
                        self.publish();
                        let _ = ack.send(());
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// Apply one feed item and return its revision; events already covered
    /// by the snapshot are skipped.
    fn apply_event(&mut self, event: Option<StoreResult<WatchEvent>>, floor: Revision) -> StoreResult<Revision> {
        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => return Err(e),
            None => return Err(StoreError::Unavailable("node cache watch closed".into())),
        };
        if event.revision() <= floor {
            return Ok(event.revision());
        }
        match &event {
            WatchEvent::Put(kv) => self.snapshot.apply_put(kv),
            WatchEvent::Delete { key, .. } => self.snapshot.apply_delete(key),
        }
        self.publish();
        Ok(event.revision())
    }

    fn publish(&self) {
        self.feed.send_replace(Some(Arc::new(self.snapshot.clone())));
    }
}
