//! Task control: the client-facing side of scheduling.
//!
//! `StartTask` and `StopTask` only write or delete the desired-task record;
//! the leader picks the change up from its watch. `TaskCommandExec` looks up
//! the placement and forwards the command over HTTP to the owning node.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use strat_core::keys::{self, DESIRED_TASK_PREFIX, NODE_LOAD_PREFIX, PLACEMENT_PREFIX, RUNNING_PREFIX};
use strat_core::{
    DesiredTask, NodeAddr, NodeLoadRecord, PlacementRecord, RunningMarker, StrategyKind, TaskKey,
    WorkerRegistration, epoch_secs,
};
use stratgrid_store::{SharedStore, StoreResult, get_json, put_json};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// Node-internal route that relays an exec command to a local supervisor.
pub const INTERNAL_EXEC_PATH: &str = "/internal/v1/tasks/exec";

/// Body of a forwarded exec command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecForward {
    pub task_key: TaskKey,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Listing entry for a desired task. Credential secrets are never included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_key: TaskKey,
    pub account: String,
    pub strategy_kind: StrategyKind,
    pub instrument_id: String,
    pub endpoint: String,
    pub node: Option<NodeAddr>,
    pub running: bool,
    pub updated_at: u64,
}

/// Listing entry for a registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub node: NodeAddr,
    pub strategy_kind: StrategyKind,
    pub registered_at: u64,
    pub tasks: usize,
}

/// Task control service. Cheap to clone.
#[derive(Clone)]
pub struct TaskControl {
    store: SharedStore,
    op_timeout: Duration,
}

impl TaskControl {
    pub fn new(store: SharedStore, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    async fn call<T>(&self, op: impl std::future::Future<Output = StoreResult<T>>) -> SchedulerResult<T> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| SchedulerError::Timeout(self.op_timeout))?
            .map_err(SchedulerError::from)
    }

    /// Declare a task desired. Re-starting an existing task updates it and
    /// keeps its creation time.
    pub async fn start_task(&self, mut task: DesiredTask) -> SchedulerResult<TaskKey> {
        validate_part("account", &task.credential.account)?;
        validate_part("strategy kind", &task.strategy_kind)?;
        validate_part("instrument id", &task.instrument_id)?;
        if task.strategy_kind.contains('/') {
            return Err(SchedulerError::InvalidTask("strategy kind must not contain '/'".into()));
        }
        task.key = TaskKey::new(&task.credential.account, &task.strategy_kind, &task.instrument_id);

        let key = keys::desired_task(&task.key);
        let existing: Option<DesiredTask> = self.call(get_json(self.store.as_ref(), &key)).await?;
        if let Some(existing) = existing {
            task.created_at = existing.created_at;
            task.updated_at = epoch_secs();
        }

        self.call(put_json(self.store.as_ref(), &key, &task, None)).await?;
        info!(task_key = %task.key, strategy_kind = %task.strategy_kind, "task start requested");
        Ok(task.key)
    }

    /// Withdraw a task. Returns false if it was not desired.
    pub async fn stop_task(&self, key: &TaskKey) -> SchedulerResult<bool> {
        let existed = self.call(self.store.delete(&keys::desired_task(key))).await?;
        info!(task_key = %key, existed, "task stop requested");
        Ok(existed)
    }

    /// Relay a command to the running task, wherever it is placed.
    pub async fn exec(&self, key: &TaskKey, params: serde_json::Value) -> SchedulerResult<NodeAddr> {
        let placement: PlacementRecord = self
            .call(get_json(self.store.as_ref(), &keys::placement(key)))
            .await?
            .ok_or_else(|| SchedulerError::NotPlaced(key.clone()))?;

        let body = serde_json::to_vec(&ExecForward {
            task_key: key.clone(),
            params,
        })?;
        forward_exec(&placement.node, body, self.op_timeout).await?;
        debug!(task_key = %key, node = %placement.node, "exec forwarded");
        Ok(placement.node)
    }

    // ── Listings ────────────────────────────────────────────────────

    pub async fn list_tasks(&self) -> SchedulerResult<Vec<TaskView>> {
        let desired = self.call(self.store.range(DESIRED_TASK_PREFIX)).await?;
        let placements = self.list_placements().await?;
        let running = self.call(self.store.range(RUNNING_PREFIX)).await?;

        let mut views = Vec::with_capacity(desired.kvs.len());
        for kv in &desired.kvs {
            let task: DesiredTask = match kv.decode() {
                Ok(task) => task,
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping unreadable desired task");
                    continue;
                }
            };
            let node = placements
                .iter()
                .find(|p| p.task_key == task.key)
                .map(|p| p.node.clone());
            let is_running = running.kvs.iter().any(|kv| {
                kv.decode::<RunningMarker>()
                    .is_ok_and(|marker| marker.task_key == task.key)
            });
            views.push(TaskView {
                task_key: task.key,
                account: task.credential.account,
                strategy_kind: task.strategy_kind,
                instrument_id: task.instrument_id,
                endpoint: task.endpoint,
                node,
                running: is_running,
                updated_at: task.updated_at,
            });
        }
        Ok(views)
    }

    pub async fn list_placements(&self) -> SchedulerResult<Vec<PlacementRecord>> {
        let range = self.call(self.store.range(PLACEMENT_PREFIX)).await?;
        Ok(range
            .kvs
            .iter()
            .filter_map(|kv| kv.decode::<PlacementRecord>().ok())
            .collect())
    }

    pub async fn list_nodes(&self) -> SchedulerResult<Vec<NodeView>> {
        let registrations = self
            .call(self.store.range(keys::WORKER_REGISTRATION_PREFIX))
            .await?;
        let loads = self.call(self.store.range(NODE_LOAD_PREFIX)).await?;

        Ok(registrations
            .kvs
            .iter()
            .filter_map(|kv| kv.decode::<WorkerRegistration>().ok())
            .map(|registration| {
                let tasks = loads
                    .kvs
                    .iter()
                    .filter_map(|kv| kv.decode::<NodeLoadRecord>().ok())
                    .find(|load| {
                        load.node == registration.node
                            && load.strategy_kind == registration.strategy_kind
                    })
                    .map_or(0, |load| load.tasks.len());
                NodeView {
                    node: registration.node,
                    strategy_kind: registration.strategy_kind,
                    registered_at: registration.registered_at,
                    tasks,
                }
            })
            .collect())
    }
}

/// Identity parts end up inside store keys, so they must be non-empty and
/// free of `/`.
fn validate_part(what: &str, value: &str) -> SchedulerResult<()> {
    if value.trim().is_empty() {
        return Err(SchedulerError::InvalidTask(format!("{what} must not be empty")));
    }
    Ok(())
}

/// POST an exec command to `node`'s internal route.
async fn forward_exec(node: &str, body: Vec<u8>, timeout: Duration) -> SchedulerResult<()> {
    match tokio::time::timeout(timeout, send_exec(node, body)).await {
        Ok(result) => result,
        Err(_) => Err(SchedulerError::Forward {
            node: node.to_string(),
            reason: "timed out".to_string(),
        }),
    }
}

async fn send_exec(node: &str, body: Vec<u8>) -> SchedulerResult<()> {
    let uri = format!("http://{node}{INTERNAL_EXEC_PATH}");
    let failed = |reason: String| SchedulerError::Forward {
        node: node.to_string(),
        reason,
    };

    let stream = tokio::net::TcpStream::connect(node)
        .await
        .map_err(|e| failed(format!("connect: {e}")))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| failed(format!("handshake: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("POST")
        .uri(&uri)
        .header("host", node)
        .header("content-type", "application/json")
        .header("user-agent", "stratgrid/0.1")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| failed(format!("request: {e}")))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| failed(format!("send: {e}")))?;
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }

    let detail = resp
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    Err(failed(format!("{status}: {}", String::from_utf8_lossy(&detail))))
}
