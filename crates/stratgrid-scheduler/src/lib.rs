//! stratgrid-scheduler: places desired tasks onto worker nodes.
//!
//! One scheduler per cluster is active at a time. It:
//!
//! - Wins a store-backed election and follows the desired-task and
//!   worker-registration feeds while it leads
//! - Places new tasks on the least-loaded registered node
//! - Re-places every task of a node whose registration disappears
//! - Runs a full reconciliation pass on taking over and after lost feeds
//!
//! `TaskControl` is the client-facing side available on every node: it
//! writes desired tasks and routes exec commands to the owning node.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (leader only)
//!   ├── NodeCache actor (node-load + registrations mirror)
//!   ├── desired-task feed ──┐
//!   ├── registration feed ──┴─> Reconciler (placement + node-load writes)
//!   └── election observer
//! ```

pub mod control;
pub mod error;
pub mod reconcile;
pub mod scheduler;

pub use control::{ExecForward, INTERNAL_EXEC_PATH, NodeView, TaskControl, TaskView};
pub use error::{SchedulerError, SchedulerResult};
pub use reconcile::{ReconcileReport, Reconciler};
pub use scheduler::Scheduler;
