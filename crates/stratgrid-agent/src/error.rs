use strat_core::TaskKey;
use stratgrid_store::StoreError;
use stratgrid_supervisor::SupervisorError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("task {0} is not supervised on this node")]
    NotHere(TaskKey),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type AgentResult<T> = Result<T, AgentError>;
