//! Reconciler: turns watch events into placement writes.
//!
//! Every step reads the store, decides, and writes. Multi-record updates are
//! separate writes: a placement record is written before the node-load
//! record that counts it, and a strategy change stops the old placement
//! before writing the new one. A failure between the two leaves the
//! intermediate state visible until the next event or full pass fixes it.
//! The full pass ends by rewriting node-load records that disagree with the
//! placements.
//!
//! All store calls are bounded by the configured op timeout. A timed-out
//! call abandons the step.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use strat_core::keys::{self, DESIRED_TASK_PREFIX, NODE_LOAD_PREFIX, PLACEMENT_PREFIX};
use strat_core::{DesiredTask, NodeAddr, NodeLoadRecord, PlacementRecord, TaskKey, epoch_secs};
use stratgrid_placement::{NodeCache, NodeSnapshot, least_loaded};
use stratgrid_store::{Revision, SharedStore, StoreResult, WatchEvent, get_json, put_json};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// Counts from one full reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub placed: usize,
    pub stopped: usize,
    pub offline_nodes: usize,
    /// Node-load records rewritten to match the placements.
    pub repaired: usize,
}

/// Writes placement and node-load records. Only the leader holds one.
pub struct Reconciler {
    store: SharedStore,
    cache: NodeCache,
    op_timeout: Duration,
}

impl Reconciler {
    pub fn new(store: SharedStore, cache: NodeCache, op_timeout: Duration) -> Self {
        Self {
            store,
            cache,
            op_timeout,
        }
    }

    /// Bound a store call by the op timeout.
    async fn call<T>(&self, op: impl Future<Output = StoreResult<T>>) -> SchedulerResult<T> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| SchedulerError::Timeout(self.op_timeout))?
            .map_err(SchedulerError::from)
    }

    async fn snapshot(&self) -> SchedulerResult<Arc<NodeSnapshot>> {
        tokio::time::timeout(self.op_timeout, self.cache.ready())
            .await
            .map_err(|_| SchedulerError::Timeout(self.op_timeout))?
            .map_err(SchedulerError::from)
    }

    /// Wait until the cache has applied registration changes up to `revision`.
    async fn snapshot_at(&self, revision: Revision) -> SchedulerResult<Arc<NodeSnapshot>> {
        tokio::time::timeout(self.op_timeout, self.cache.ready_at(revision))
            .await
            .map_err(|_| SchedulerError::Timeout(self.op_timeout))?
            .map_err(SchedulerError::from)
    }

    async fn placement_of(&self, key: &TaskKey) -> SchedulerResult<Option<PlacementRecord>> {
        self.call(get_json(self.store.as_ref(), &keys::placement(key)))
            .await
    }

    async fn desired(&self, key: &TaskKey) -> SchedulerResult<Option<DesiredTask>> {
        self.call(get_json(self.store.as_ref(), &keys::desired_task(key)))
            .await
    }

    // ── Event handlers ──────────────────────────────────────────────

    /// Apply one event from the `desired-task/` feed.
    pub async fn on_desired_event(&self, event: WatchEvent) -> SchedulerResult<()> {
        match event {
            WatchEvent::Put(kv) => {
                let task: DesiredTask = kv.decode()?;
                self.on_desired_put(&task).await
            }
            WatchEvent::Delete { key, .. } => match keys::task_key_of(DESIRED_TASK_PREFIX, &key) {
                Some(task_key) => self.on_desired_delete(&task_key).await,
                None => Ok(()),
            },
        }
    }

    /// Apply one event from the `worker-registration/` feed.
    pub async fn on_registration_event(&self, event: WatchEvent) -> SchedulerResult<()> {
        let key = event.key().to_string();
        let Some((kind, node)) = keys::kind_and_node(keys::WORKER_REGISTRATION_PREFIX, &key) else {
            return Ok(());
        };
        self.snapshot_at(event.revision()).await?;
        match event {
            WatchEvent::Put(_) => {
                let placed = self.on_worker_online(kind).await?;
                debug!(strategy_kind = kind, %node, placed, "worker registered");
                Ok(())
            }
            WatchEvent::Delete { .. } => self.on_worker_offline(kind, node).await.map(|_| ()),
        }
    }

    /// A desired task was created or updated.
    pub async fn on_desired_put(&self, task: &DesiredTask) -> SchedulerResult<()> {
        match self.placement_of(&task.key).await? {
            Some(existing) if existing.strategy_kind == task.strategy_kind => {
                debug!(task_key = %task.key, node = %existing.node, "desired task unchanged, keeping placement");
                Ok(())
            }
            Some(existing) => {
                info!(
                    task_key = %task.key,
                    from = %existing.strategy_kind,
                    to = %task.strategy_kind,
                    "strategy kind changed, re-placing"
                );
                self.stop_task(&task.key).await?;
                self.place(task).await.map(|_| ())
            }
            None => self.place(task).await.map(|_| ()),
        }
    }

    pub async fn on_desired_delete(&self, key: &TaskKey) -> SchedulerResult<()> {
        self.stop_task(key).await
    }

    /// A worker registered for `strategy_kind`: place tasks of that kind
    /// that found no eligible node earlier.
    pub async fn on_worker_online(&self, strategy_kind: &str) -> SchedulerResult<usize> {
        let desired = self.call(self.store.range(DESIRED_TASK_PREFIX)).await?;
        let mut placed = 0;
        for kv in &desired.kvs {
            let task: DesiredTask = match kv.decode() {
                Ok(task) => task,
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping unreadable desired task");
                    continue;
                }
            };
            if task.strategy_kind != strategy_kind || self.placement_of(&task.key).await?.is_some() {
                continue;
            }
            self.place(&task).await?;
            placed += 1;
        }
        Ok(placed)
    }

    /// A worker went away: drop its load record and re-place every task it
    /// held. Tasks whose desired record is gone are skipped.
    pub async fn on_worker_offline(&self, strategy_kind: &str, node: &str) -> SchedulerResult<usize> {
        let load_key = keys::node_load(strategy_kind, node);
        let record: Option<NodeLoadRecord> = self.call(get_json(self.store.as_ref(), &load_key)).await?;
        self.call(self.store.delete(&load_key)).await?;
        self.cache.note_offline(strategy_kind, node).await;

        let Some(record) = record else {
            debug!(strategy_kind, %node, "offline worker held no tasks");
            return Ok(0);
        };
        warn!(strategy_kind, %node, tasks = record.tasks.len(), "worker offline, re-placing its tasks");

        let mut moved = 0;
        for task_key in &record.tasks {
            match self.placement_of(task_key).await? {
                Some(current) if current.node != node => {
                    debug!(%task_key, node = %current.node, "task already placed elsewhere");
                    continue;
                }
                Some(_) => {
                    self.call(self.store.delete(&keys::placement(task_key))).await?;
                }
                None => {}
            }
            let Some(task) = self.desired(task_key).await? else {
                debug!(%task_key, "desired task gone, not re-placing");
                continue;
            };
            match self.place(&task).await {
                Ok(_) => moved += 1,
                Err(e) => warn!(%task_key, error = %e, "could not re-place task"),
            }
        }
        Ok(moved)
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Choose a node for `task`, write its placement, then count it in the
    /// node's load record.
    pub async fn place(&self, task: &DesiredTask) -> SchedulerResult<NodeAddr> {
        let snapshot = self.snapshot().await?;
        let node = least_loaded(&task.strategy_kind, &snapshot)?;

        let record = PlacementRecord {
            task_key: task.key.clone(),
            node: node.clone(),
            strategy_kind: task.strategy_kind.clone(),
            placed_at: epoch_secs(),
        };
        self.call(put_json(self.store.as_ref(), &keys::placement(&task.key), &record, None))
            .await?;

        let load_key = keys::node_load(&task.strategy_kind, &node);
        let mut load: NodeLoadRecord = self
            .call(get_json(self.store.as_ref(), &load_key))
            .await?
            .unwrap_or_else(|| NodeLoadRecord::empty(&task.strategy_kind, &node));
        if load.tasks.insert(task.key.clone()) {
            self.call(put_json(self.store.as_ref(), &load_key, &load, None))
                .await?;
        }
        self.cache
            .note_placed(&task.strategy_kind, &node, &task.key)
            .await;

        info!(task_key = %task.key, %node, strategy_kind = %task.strategy_kind, "task placed");
        Ok(node)
    }

    /// Remove a task's placement and its entry in the node's load record.
    pub async fn stop_task(&self, key: &TaskKey) -> SchedulerResult<()> {
        let Some(placement) = self.placement_of(key).await? else {
            debug!(task_key = %key, "task has no placement");
            return Ok(());
        };
        self.call(self.store.delete(&keys::placement(key))).await?;

        let load_key = keys::node_load(&placement.strategy_kind, &placement.node);
        let load: Option<NodeLoadRecord> = self.call(get_json(self.store.as_ref(), &load_key)).await?;
        if let Some(mut load) = load {
            if load.tasks.remove(key) {
                self.call(put_json(self.store.as_ref(), &load_key, &load, None))
                    .await?;
            }
        }
        self.cache
            .note_removed(&placement.strategy_kind, &placement.node, key)
            .await;

        info!(task_key = %key, node = %placement.node, "task stopped");
        Ok(())
    }

    // ── Full pass ───────────────────────────────────────────────────

    /// Bring placement state in line with the desired tasks and the live
    /// registrations. Run on gaining leadership and after a feed is lost.
    pub async fn reconcile_all(&self) -> SchedulerResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        // Load records of nodes that are no longer registered.
        let snapshot = self.snapshot().await?;
        let orphaned: Vec<(String, String)> = snapshot
            .load_records()
            .filter(|(kind, node, _)| !snapshot.is_registered(kind, node))
            .map(|(kind, node, _)| (kind.to_string(), node.to_string()))
            .collect();
        for (kind, node) in &orphaned {
            self.on_worker_offline(kind, node).await?;
            report.offline_nodes += 1;
        }

        let snapshot = self.snapshot().await?;
        let desired = self.call(self.store.range(DESIRED_TASK_PREFIX)).await?;
        let mut wanted = std::collections::BTreeSet::new();
        for kv in &desired.kvs {
            let task: DesiredTask = match kv.decode() {
                Ok(task) => task,
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping unreadable desired task");
                    continue;
                }
            };
            wanted.insert(task.key.clone());

            let needs_placement = match self.placement_of(&task.key).await? {
                None => true,
                Some(existing)
                    if existing.strategy_kind != task.strategy_kind
                        || !snapshot.is_registered(&existing.strategy_kind, &existing.node) =>
                {
                    self.stop_task(&task.key).await?;
                    report.stopped += 1;
                    true
                }
                Some(_) => false,
            };
            if needs_placement {
                match self.place(&task).await {
                    Ok(_) => report.placed += 1,
                    Err(e) => warn!(task_key = %task.key, error = %e, "could not place task"),
                }
            }
        }

        // Placements without a desired task.
        let placements = self.call(self.store.range(PLACEMENT_PREFIX)).await?;
        for kv in &placements.kvs {
            if let Some(task_key) = keys::task_key_of(PLACEMENT_PREFIX, &kv.key) {
                if !wanted.contains(&task_key) {
                    self.stop_task(&task_key).await?;
                    report.stopped += 1;
                }
            }
        }

        report.repaired = self.repair_loads().await?;

        info!(
            placed = report.placed,
            stopped = report.stopped,
            offline_nodes = report.offline_nodes,
            repaired = report.repaired,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    /// Rewrite every node-load record whose task set differs from the
    /// placements naming that node. Returns the number rewritten.
    async fn repair_loads(&self) -> SchedulerResult<usize> {
        let placements = self.call(self.store.range(PLACEMENT_PREFIX)).await?;
        let mut expected: BTreeMap<(String, String), BTreeSet<TaskKey>> = BTreeMap::new();
        for kv in &placements.kvs {
            match kv.decode::<PlacementRecord>() {
                Ok(p) => {
                    expected
                        .entry((p.strategy_kind, p.node))
                        .or_default()
                        .insert(p.task_key);
                }
                Err(e) => warn!(key = %kv.key, error = %e, "skipping unreadable placement"),
            }
        }

        let loads = self.call(self.store.range(NODE_LOAD_PREFIX)).await?;
        let mut repaired = 0;
        for kv in &loads.kvs {
            let Some((kind, node)) = keys::kind_and_node(NODE_LOAD_PREFIX, &kv.key) else {
                continue;
            };
            let tasks = expected
                .remove(&(kind.to_string(), node.to_string()))
                .unwrap_or_default();
            let counted = match kv.decode::<NodeLoadRecord>() {
                Ok(record) if record.tasks == tasks => continue,
                Ok(record) => record.tasks,
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "replacing unreadable node-load record");
                    BTreeSet::new()
                }
            };
            self.rewrite_load(kind, node, tasks, counted).await?;
            repaired += 1;
        }
        for ((kind, node), tasks) in expected {
            self.rewrite_load(&kind, &node, tasks, BTreeSet::new()).await?;
            repaired += 1;
        }
        Ok(repaired)
    }

    async fn rewrite_load(
        &self,
        strategy_kind: &str,
        node: &str,
        tasks: BTreeSet<TaskKey>,
        counted: BTreeSet<TaskKey>,
    ) -> SchedulerResult<()> {
        warn!(
            strategy_kind,
            %node,
            counted = counted.len(),
            placed = tasks.len(),
            "node load out of step with placements, rewriting"
        );
        let record = NodeLoadRecord {
            node: node.to_string(),
            strategy_kind: strategy_kind.to_string(),
            tasks,
        };
        self.call(put_json(
            self.store.as_ref(),
            &keys::node_load(strategy_kind, node),
            &record,
            None,
        ))
        .await?;
        for key in record.tasks.difference(&counted) {
            self.cache.note_placed(strategy_kind, node, key).await;
        }
        for key in counted.difference(&record.tasks) {
            self.cache.note_removed(strategy_kind, node, key).await;
        }
        Ok(())
    }
}
