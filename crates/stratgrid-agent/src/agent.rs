//! Worker agent: runs the tasks the scheduler places on this node.
//!
//! The agent follows `placement/`: a record naming this node gets a local
//! [`Supervisor`]; a record that disappears or moves elsewhere has its
//! supervisor closed. After every (re)subscription the agent snapshots
//! the prefix and resyncs, so missed events are repaired.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use strat_core::config::AgentConfig;
use strat_core::keys::{self, PLACEMENT_PREFIX};
use strat_core::{DesiredTask, NodeAddr, PlacementRecord, StrategyKind, TaskKey};
use stratgrid_store::{SharedStore, StoreResult, WatchEvent, get_json};
use stratgrid_supervisor::{Phase, Supervisor, SupervisorContext};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::registration;

/// Delay before re-subscribing a lost placement feed.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(200);

/// Worker-side node agent. Cheap to clone.
#[derive(Clone)]
pub struct WorkerAgent {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: SupervisorContext,
    kinds: Vec<StrategyKind>,
    registration_ttl: Duration,
    supervisors: Mutex<HashMap<TaskKey, Arc<Supervisor>>>,
}

impl WorkerAgent {
    /// `ctx.node` is the address this worker registers under.
    pub fn new(ctx: SupervisorContext, kinds: Vec<StrategyKind>, config: &AgentConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                kinds,
                registration_ttl: Duration::from_secs(config.registration_ttl_secs),
                supervisors: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn node(&self) -> &NodeAddr {
        &self.inner.ctx.node
    }

    fn store(&self) -> &SharedStore {
        &self.inner.ctx.store
    }

    /// Register, follow placements, and supervise local tasks until
    /// `shutdown` fires. On exit every supervisor is closed before the
    /// registrations are removed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let registration = tokio::spawn(registration::maintain(
            self.store().clone(),
            self.node().clone(),
            self.inner.kinds.clone(),
            self.inner.registration_ttl,
            stop_rx,
        ));

        self.follow_placements(&mut shutdown).await;

        self.close_all().await;
        let _ = stop_tx.send(true);
        let _ = registration.await;
        info!(node = %self.node(), "worker agent stopped");
    }

    /// Relay a command to a task supervised on this node.
    pub async fn exec(&self, task_key: &TaskKey, params: serde_json::Value) -> AgentResult<()> {
        let supervisor = self
            .inner
            .supervisors
            .lock()
            .await
            .get(task_key)
            .cloned()
            .ok_or_else(|| AgentError::NotHere(task_key.clone()))?;
        supervisor.exec(params).await?;
        Ok(())
    }

    /// Tasks supervised here and their current phase.
    pub async fn tasks(&self) -> Vec<(TaskKey, Phase)> {
        let supervisors = self.inner.supervisors.lock().await;
        let mut tasks: Vec<_> = supervisors
            .iter()
            .map(|(key, supervisor)| (key.clone(), supervisor.phase()))
            .collect();
        tasks.sort_by(|a, b| a.0.cmp(&b.0));
        tasks
    }

    // ── Placement feed ───────────────────────────────────────────

    async fn follow_placements(&self, shutdown: &mut watch::Receiver<bool>) {
        loop {
            match self.store().watch(PLACEMENT_PREFIX).await {
                Ok(mut events) => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "placement resync failed");
                    }
                    loop {
                        tokio::select! {
                            event = events.recv() => match event {
                                Some(Ok(event)) => {
                                    if let Err(e) = self.on_placement_event(event).await {
                                        warn!(error = %e, "placement event abandoned");
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "placement feed lost, resubscribing");
                                    break;
                                }
                                None => {
                                    warn!("placement feed closed, resubscribing");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => return,
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to watch placements"),
            }

            tokio::select! {
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Align local supervisors with a full placement snapshot.
    async fn resync(&self) -> StoreResult<()> {
        let snapshot = self.store().range(PLACEMENT_PREFIX).await?;
        let mut mine = BTreeSet::new();
        for kv in &snapshot.kvs {
            match kv.decode::<PlacementRecord>() {
                Ok(record) if record.node == *self.node() => {
                    mine.insert(record.task_key);
                }
                Ok(_) => {}
                Err(e) => warn!(key = %kv.key, error = %e, "skipping undecodable placement"),
            }
        }

        let stale: Vec<TaskKey> = self
            .inner
            .supervisors
            .lock()
            .await
            .keys()
            .filter(|key| !mine.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            self.stop_local(&key).await;
        }
        for key in mine {
            self.start_local(&key).await?;
        }
        debug!(node = %self.node(), revision = snapshot.revision, "placements resynced");
        Ok(())
    }

    async fn on_placement_event(&self, event: WatchEvent) -> StoreResult<()> {
        match event {
            WatchEvent::Put(kv) => {
                let record: PlacementRecord = kv.decode()?;
                if record.node == *self.node() {
                    self.start_local(&record.task_key).await?;
                } else {
                    self.stop_local(&record.task_key).await;
                }
            }
            WatchEvent::Delete { key, .. } => {
                if let Some(task_key) = keys::task_key_of(PLACEMENT_PREFIX, &key) {
                    self.stop_local(&task_key).await;
                }
            }
        }
        Ok(())
    }

    // ── Local supervisors ────────────────────────────────────────

    async fn start_local(&self, task_key: &TaskKey) -> StoreResult<()> {
        if self.inner.supervisors.lock().await.contains_key(task_key) {
            return Ok(());
        }
        let Some(task) =
            get_json::<DesiredTask>(self.store().as_ref(), &keys::desired_task(task_key)).await?
        else {
            debug!(%task_key, "placed task has no desired record, skipping");
            return Ok(());
        };

        let mut supervisors = self.inner.supervisors.lock().await;
        if !supervisors.contains_key(task_key) {
            info!(%task_key, node = %self.node(), "starting supervisor");
            let supervisor = Supervisor::start(task, self.inner.ctx.clone());
            supervisors.insert(task_key.clone(), Arc::new(supervisor));
        }
        Ok(())
    }

    async fn stop_local(&self, task_key: &TaskKey) {
        let removed = self.inner.supervisors.lock().await.remove(task_key);
        if let Some(supervisor) = removed {
            info!(%task_key, node = %self.node(), "closing supervisor");
            supervisor.close().await;
        }
    }

    async fn close_all(&self) {
        let supervisors: Vec<_> = self.inner.supervisors.lock().await.drain().collect();
        for (task_key, supervisor) in supervisors {
            debug!(%task_key, "closing supervisor for shutdown");
            supervisor.close().await;
        }
    }
}
