//! Supervisor: keeps one strategy process alive and confirmed running.
//!
//! ```text
//!            spawn ok             start ack
//! Stopped ───────────▶ ProcessStarted ───────────▶ Running
//!    ▲                      │                        │
//!    └──── process exit ────┴────────────────────────┘
//!          (backoff, respawn on the same endpoint)
//! ```
//!
//! All state is owned by one actor task. The handle talks to it through a
//! command channel; process exits and start-command outcomes arrive on
//! their own channels tagged with the spawn generation, so events from a
//! process that has already been replaced are dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strat_core::config::SupervisorConfig;
use strat_core::keys;
use strat_core::{DesiredTask, NodeAddr, RunningMarker, TaskKey, epoch_secs};
use stratgrid_store::{LeaseId, LeaseKeeper, SharedStore, StoreError, StoreResult, put_json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::{ControlClient, StrategySpec};
use crate::error::{ControlResult, SupervisorError, SupervisorResult};
use crate::process::{ProcessExit, ProcessHandle, ProcessLauncher};

/// Lifecycle phase of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    ProcessStarted,
    Running,
    /// Terminal: the supervisor has released everything.
    Closed,
}

/// Shared dependencies for every supervisor on a node.
#[derive(Clone)]
pub struct SupervisorContext {
    pub store: SharedStore,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub node: NodeAddr,
    pub socket_dir: PathBuf,
    pub config: SupervisorConfig,
}

enum Command {
    Exec {
        params: serde_json::Value,
        reply: oneshot::Sender<SupervisorResult<()>>,
    },
    Close,
}

struct StartOutcome {
    generation: u64,
    result: ControlResult<()>,
}

#[derive(Debug, Clone, Copy)]
enum Wake {
    Start,
    Restart,
}

/// Handle to the supervisor of one task. Dropping it closes the supervisor.
pub struct Supervisor {
    task_key: TaskKey,
    endpoint: PathBuf,
    commands: mpsc::Sender<Command>,
    phase: watch::Receiver<Phase>,
}

impl Supervisor {
    /// Allocate the task's control endpoint and start supervising.
    pub fn start(task: DesiredTask, ctx: SupervisorContext) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        let endpoint = ctx.socket_dir.join(format!(
            "strat-{}-{}.sock",
            task.key.fingerprint(),
            &suffix[..8]
        ));
        let command_timeout = Duration::from_millis(ctx.config.command_timeout_ms);

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (exits_tx, exits_rx) = mpsc::channel(4);
        let (started_tx, started_rx) = mpsc::channel(4);
        let (phase_tx, phase_rx) = watch::channel(Phase::Stopped);

        let task_key = task.key.clone();
        let actor = Actor {
            spec: StrategySpec::from(&task),
            task,
            client: ControlClient::new(endpoint.clone(), command_timeout),
            endpoint: endpoint.clone(),
            ctx,
            phase: phase_tx,
            generation: 0,
            process: None,
            marker: None,
            attempt: None,
            wake: None,
            exits: exits_tx,
            started: started_tx,
        };
        tokio::spawn(actor.run(commands_rx, exits_rx, started_rx));

        Self {
            task_key,
            endpoint,
            commands: commands_tx,
            phase: phase_rx,
        }
    }

    pub fn task_key(&self) -> &TaskKey {
        &self.task_key
    }

    /// Unix socket path of the control channel.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Relay a command to the running strategy.
    pub async fn exec(&self, params: serde_json::Value) -> SupervisorResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Exec { params, reply })
            .await
            .map_err(|_| SupervisorError::Closed(self.task_key.clone()))?;
        rx.await
            .map_err(|_| SupervisorError::Closed(self.task_key.clone()))?
    }

    /// Stop the process and release the endpoint and lease. Safe to call
    /// repeatedly and concurrently; teardown happens once.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
        let mut phase = self.phase.clone();
        let _ = phase.wait_for(|phase| *phase == Phase::Closed).await;
    }
}

// ── Actor ─────────────────────────────────────────────────────────

struct Actor {
    task: DesiredTask,
    spec: StrategySpec,
    ctx: SupervisorContext,
    endpoint: PathBuf,
    client: ControlClient,
    phase: watch::Sender<Phase>,
    generation: u64,
    process: Option<ProcessHandle>,
    marker: Option<LeaseKeeper>,
    attempt: Option<JoinHandle<()>>,
    wake: Option<(Instant, Wake)>,
    exits: mpsc::Sender<ProcessExit>,
    started: mpsc::Sender<StartOutcome>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut exits: mpsc::Receiver<ProcessExit>,
        mut started: mpsc::Receiver<StartOutcome>,
    ) {
        info!(task_key = %self.task.key, endpoint = %self.endpoint.display(), "supervisor started");
        self.spawn_process();

        loop {
            let wake_at = self.wake.map(|(at, _)| at);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Exec { params, reply }) => self.exec(params, reply),
                    Some(Command::Close) | None => break,
                },
                Some(exit) = exits.recv() => self.on_exit(exit).await,
                Some(outcome) = started.recv() => self.on_start_outcome(outcome).await,
                _ = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {
                    self.on_wake();
                }
                _ = marker_lost(self.marker.as_ref()) => {
                    warn!(task_key = %self.task.key, "running marker lease lost, republishing");
                    self.marker = None;
                    self.publish_marker().await;
                }
            }
        }

        self.shutdown().await;
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    fn current_phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Spawn a fresh child on the task's endpoint and start driving it.
    fn spawn_process(&mut self) {
        self.generation += 1;
        match self.ctx.launcher.launch(&self.task.key, &self.endpoint) {
            Ok(child) => {
                let handle = ProcessHandle::monitor(child, self.generation, self.exits.clone());
                info!(
                    task_key = %self.task.key,
                    pid = ?handle.pid(),
                    generation = self.generation,
                    "strategy process spawned"
                );
                self.process = Some(handle);
                self.set_phase(Phase::ProcessStarted);
                self.wake = Some((Instant::now(), Wake::Start));
            }
            Err(e) => {
                warn!(task_key = %self.task.key, error = %e, "failed to spawn strategy process");
                self.schedule_restart();
            }
        }
    }

    fn schedule_restart(&mut self) {
        let backoff = Duration::from_millis(self.ctx.config.restart_backoff_ms);
        self.wake = Some((Instant::now() + backoff, Wake::Restart));
    }

    fn on_wake(&mut self) {
        match self.wake.take() {
            Some((_, Wake::Start)) => self.attempt_start(),
            Some((_, Wake::Restart)) => {
                debug!(task_key = %self.task.key, "restarting strategy process");
                self.spawn_process();
            }
            None => {}
        }
    }

    /// Issue one StartStrategy in the background; the outcome comes back
    /// on the `started` channel.
    fn attempt_start(&mut self) {
        let client = self.client.clone();
        let spec = self.spec.clone();
        let started = self.started.clone();
        let generation = self.generation;
        self.attempt = Some(tokio::spawn(async move {
            let result = client.start_strategy(&spec).await;
            let _ = started.send(StartOutcome { generation, result }).await;
        }));
    }

    async fn on_start_outcome(&mut self, outcome: StartOutcome) {
        self.attempt = None;
        if outcome.generation != self.generation || self.current_phase() != Phase::ProcessStarted {
            return;
        }
        match outcome.result {
            Ok(()) => {
                info!(task_key = %self.task.key, generation = self.generation, "strategy running");
                self.publish_marker().await;
                self.set_phase(Phase::Running);
            }
            Err(e) => {
                debug!(task_key = %self.task.key, error = %e, "start command failed, retrying");
                let retry = Duration::from_millis(self.ctx.config.start_retry_ms);
                self.wake = Some((Instant::now() + retry, Wake::Start));
            }
        }
    }

    async fn on_exit(&mut self, exit: ProcessExit) {
        if exit.generation != self.generation {
            debug!(task_key = %self.task.key, generation = exit.generation, "ignoring stale exit");
            return;
        }
        warn!(
            task_key = %self.task.key,
            status = ?exit.status,
            generation = exit.generation,
            "strategy process exited"
        );

        self.set_phase(Phase::Stopped);
        self.cancel_attempt();
        self.release_marker().await;
        if let Some(process) = self.process.take() {
            process.terminate().await;
        }
        self.schedule_restart();
    }

    fn cancel_attempt(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
    }

    fn exec(&self, params: serde_json::Value, reply: oneshot::Sender<SupervisorResult<()>>) {
        if self.current_phase() != Phase::Running {
            let _ = reply.send(Err(SupervisorError::NotRunning(self.task.key.clone())));
            return;
        }
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = client.exec(params).await.map_err(SupervisorError::from);
            let _ = reply.send(result);
        });
    }

    // ── Running marker ───────────────────────────────────────────

    async fn publish_marker(&mut self) {
        let ttl = Duration::from_secs(self.ctx.config.lease_ttl_secs);
        let marker = RunningMarker {
            task_key: self.task.key.clone(),
            node: self.ctx.node.clone(),
            pid: self.process.as_ref().and_then(ProcessHandle::pid),
            since: epoch_secs(),
        };
        match write_marker(&self.ctx.store, &marker, ttl).await {
            Ok(lease) => {
                debug!(task_key = %self.task.key, lease, "running marker published");
                self.marker = Some(LeaseKeeper::spawn(self.ctx.store.clone(), lease, ttl));
            }
            Err(e) => warn!(task_key = %self.task.key, error = %e, "failed to publish running marker"),
        }
    }

    async fn release_marker(&mut self) {
        let Some(keeper) = self.marker.take() else {
            return;
        };
        let lease = keeper.lease();
        keeper.stop().await;
        match self.ctx.store.revoke_lease(lease).await {
            Ok(()) | Err(StoreError::LeaseNotFound(_)) => {}
            Err(e) => warn!(task_key = %self.task.key, lease, error = %e, "failed to release running marker"),
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        self.generation += 1;
        self.wake = None;
        self.cancel_attempt();

        if self.current_phase() == Phase::Running {
            if let Err(e) = self.client.stop_strategy().await {
                debug!(task_key = %self.task.key, error = %e, "stop command failed");
            }
        }
        self.release_marker().await;
        if let Some(process) = self.process.take() {
            process.terminate().await;
        }
        match std::fs::remove_file(&self.endpoint) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(endpoint = %self.endpoint.display(), error = %e, "failed to remove control endpoint"),
        }

        self.set_phase(Phase::Closed);
        info!(task_key = %self.task.key, "supervisor closed");
    }
}

/// Grant a lease and write the marker under it.
async fn write_marker(store: &SharedStore, marker: &RunningMarker, ttl: Duration) -> StoreResult<LeaseId> {
    let lease = store.grant_lease(ttl).await?;
    if let Err(e) = put_json(store.as_ref(), &keys::running(&marker.task_key), marker, Some(lease)).await {
        let _ = store.revoke_lease(lease).await;
        return Err(e);
    }
    Ok(lease)
}

async fn marker_lost(marker: Option<&LeaseKeeper>) {
    match marker {
        Some(keeper) => keeper.lost().await,
        None => std::future::pending().await,
    }
}
