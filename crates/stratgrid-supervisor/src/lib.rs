//! stratgrid-supervisor: per-task process supervision for StratGrid.
//!
//! A worker node runs one [`Supervisor`] per task placed on it. The
//! supervisor spawns the strategy process, drives it to `Running` over a
//! private control channel, and respawns it whenever it dies.
//!
//! # Architecture
//!
//! ```text
//! Supervisor (handle)
//!   └── actor task (owns all state)
//!         ├── ProcessHandle ── exit listener task per child
//!         ├── ControlClient ── StartStrategy / StopStrategy / Exec
//!         └── LeaseKeeper   ── running/{task_key} marker
//!
//! child process (`stratd runner --endpoint <sock>`)
//!   └── ControlServer ── StrategyHost
//! ```
//!
//! Restart and start-command retries use fixed delays with no attempt
//! ceiling.

pub mod control;
pub mod error;
pub mod host;
pub mod process;
pub mod supervisor;

pub use control::{ControlClient, ControlReply, ControlRequest, ControlServer, StrategySpec};
pub use error::{ControlError, ControlResult, SupervisorError, SupervisorResult};
pub use host::{HostState, RecordingHost, StrategyHost};
pub use process::{ProcessExit, ProcessHandle, ProcessLauncher, RunnerLauncher};
pub use supervisor::{Phase, Supervisor, SupervisorContext};
