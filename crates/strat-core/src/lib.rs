//! strat-core: shared vocabulary for StratGrid crates.
//!
//! - **`types`**: task identity and the records persisted in the
//!   coordination store (desired tasks, placements, node load, worker
//!   registrations, running markers)
//! - **`keys`**: the coordination-store key layout
//! - **`config`**: node configuration loaded from TOML

pub mod config;
pub mod keys;
pub mod types;

pub use config::{ConfigError, NodeConfig};
pub use types::*;
