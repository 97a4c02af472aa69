//! Strategy hosts: what a child process runs behind its control channel.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::control::StrategySpec;

/// Runs at most one strategy instance inside a child process.
#[async_trait]
pub trait StrategyHost: Send + Sync + 'static {
    /// Start the strategy. Repeating the active spec succeeds.
    async fn start(&self, spec: StrategySpec) -> anyhow::Result<()>;

    /// Stop the strategy. Succeeds when nothing runs.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Forward a command to the running strategy.
    async fn exec(&self, params: serde_json::Value) -> anyhow::Result<()>;
}

/// What a [`RecordingHost`] has been told so far.
#[derive(Debug, Clone, Default)]
pub struct HostState {
    pub active: Option<StrategySpec>,
    pub commands: Vec<serde_json::Value>,
}

/// Host that tracks and logs commands without trading.
#[derive(Debug, Default)]
pub struct RecordingHost {
    state: Mutex<HostState>,
}

impl RecordingHost {
    pub async fn snapshot(&self) -> HostState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl StrategyHost for RecordingHost {
    async fn start(&self, spec: StrategySpec) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(active) = &state.active {
            anyhow::ensure!(
                active.task_key() == spec.task_key(),
                "strategy {} already running",
                active.task_key()
            );
        }
        info!(
            task_key = %spec.task_key(),
            strategy_kind = %spec.strategy_kind,
            endpoint = %spec.endpoint,
            "strategy started"
        );
        state.active = Some(spec);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(spec) = self.state.lock().await.active.take() {
            info!(task_key = %spec.task_key(), "strategy stopped");
        }
        Ok(())
    }

    async fn exec(&self, params: serde_json::Value) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let Some(active) = &state.active else {
            anyhow::bail!("no strategy running");
        };
        info!(task_key = %active.task_key(), %params, "strategy command");
        state.commands.push(params);
        Ok(())
    }
}
