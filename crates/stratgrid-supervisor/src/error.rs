//! Error types for the control channel and the supervisor.

use std::path::PathBuf;
use std::time::Duration;

use strat_core::TaskKey;
use stratgrid_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("failed to bind control endpoint {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("control endpoint {path} not reachable: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("control channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed control message: {0}")]
    Protocol(String),

    #[error("strategy rejected command: {0}")]
    Rejected(String),

    #[error("control command timed out after {0:?}")]
    Timeout(Duration),
}

pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("task {0} is not running")]
    NotRunning(TaskKey),

    #[error("supervisor for task {0} is closed")]
    Closed(TaskKey),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
