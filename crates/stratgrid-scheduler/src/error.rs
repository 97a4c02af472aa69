//! Scheduler error types.

use std::time::Duration;

use strat_core::TaskKey;
use stratgrid_placement::PlacementError;
use stratgrid_store::StoreError;
use thiserror::Error;

/// Errors that can occur during scheduling and task control.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task is not placed: {0}")]
    NotPlaced(TaskKey),

    #[error("forwarding to {node} failed: {reason}")]
    Forward { node: String, reason: String },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
