//! stratgrid-agent: the worker side of a StratGrid node.
//!
//! # Architecture
//!
//! ```text
//! WorkerAgent
//!   ├── registration loop
//!   │   └── worker-registration/{kind}/{node} for each kind, one lease
//!   └── placement loop
//!       ├── snapshot + watch of placement/
//!       └── Supervisor per task placed on this node
//! ```
//!
//! Losing the registration lease re-registers under a new one. Losing the
//! placement feed re-snapshots and resyncs local supervisors.

pub mod agent;
pub mod error;
pub mod registration;

pub use agent::WorkerAgent;
pub use error::{AgentError, AgentResult};
