//! Child process launch and death detection.
//!
//! Each spawned child gets one listener task that awaits its exit. A
//! natural exit is reported as a [`ProcessExit`]; a kill requested through
//! [`ProcessHandle::terminate`] reaps the child silently.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use strat_core::TaskKey;
use strat_core::config::SupervisorConfig;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Starts the child process for a task.
pub trait ProcessLauncher: Send + Sync + 'static {
    /// Spawn a child that serves its control channel on `endpoint`.
    fn launch(&self, task_key: &TaskKey, endpoint: &Path) -> std::io::Result<Child>;
}

/// Launches `<program> <args..> --endpoint <path>`.
#[derive(Debug, Clone)]
pub struct RunnerLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl RunnerLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Use the configured runner, or this executable when none is set.
    pub fn from_config(config: &SupervisorConfig) -> std::io::Result<Self> {
        let program = match &config.runner_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        Ok(Self::new(program, config.runner_args.clone()))
    }
}

impl ProcessLauncher for RunnerLauncher {
    fn launch(&self, task_key: &TaskKey, endpoint: &Path) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .arg("--endpoint")
            .arg(endpoint)
            .env("STRATGRID_TASK_KEY", task_key.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

/// A child exited on its own.
#[derive(Debug)]
pub struct ProcessExit {
    /// Spawn generation the exit belongs to.
    pub generation: u64,
    /// `None` when waiting on the child failed.
    pub status: Option<ExitStatus>,
}

/// Owns a running child through its listener task.
pub struct ProcessHandle {
    pid: Option<u32>,
    generation: u64,
    kill: Option<oneshot::Sender<()>>,
    listener: JoinHandle<()>,
}

impl ProcessHandle {
    /// Take ownership of `child` and report its exit on `exits`.
    pub fn monitor(mut child: Child, generation: u64, exits: mpsc::Sender<ProcessExit>) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let listener = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let status = match status {
                        Ok(status) => Some(status),
                        Err(e) => {
                            warn!(?pid, error = %e, "waiting on strategy process failed");
                            None
                        }
                    };
                    let _ = exits.send(ProcessExit { generation, status }).await;
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        debug!(?pid, error = %e, "kill after exit");
                    }
                    debug!(?pid, generation, "strategy process reaped");
                }
            }
        });

        Self {
            pid,
            generation,
            kill: Some(kill_tx),
            listener,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Kill the child if it still runs, reap it, and stop the listener.
    pub async fn terminate(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        let _ = (&mut self.listener).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sleeper(secs: &str) -> Child {
        Command::new("sleep").arg(secs).kill_on_drop(true).spawn().unwrap()
    }

    #[tokio::test]
    async fn natural_exit_is_reported() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ProcessHandle::monitor(Command::new("true").spawn().unwrap(), 7, tx);
        assert!(handle.pid().is_some());

        let exit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.generation, 7);
        assert!(exit.status.unwrap().success());
    }

    #[tokio::test]
    async fn terminate_kills_without_reporting() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ProcessHandle::monitor(sleeper("30"), 1, tx);
        let pid = handle.pid().unwrap() as libc::pid_t;

        handle.terminate().await;
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1, "process should be reaped");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn runner_launcher_passes_endpoint() {
        let script = "test \"$1\" = --endpoint && test \"$2\" = /tmp/x.sock";
        let launcher = RunnerLauncher::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        );
        let mut child = launcher
            .launch(&TaskKey::from_raw("a:grid:BTC"), Path::new("/tmp/x.sock"))
            .unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
