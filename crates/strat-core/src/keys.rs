//! Coordination-store key layout.
//!
//! ```text
//! desired-task/{task_key}                  → DesiredTask
//! placement/{task_key}                     → PlacementRecord
//! node-load/{strategy_kind}/{node}         → NodeLoadRecord
//! worker-registration/{strategy_kind}/{node} → WorkerRegistration (leased)
//! election/{name}                          → leader identity (leased)
//! running/{task_key}                       → RunningMarker (leased)
//! ```

use crate::types::TaskKey;

pub const DESIRED_TASK_PREFIX: &str = "desired-task/";
pub const PLACEMENT_PREFIX: &str = "placement/";
pub const NODE_LOAD_PREFIX: &str = "node-load/";
pub const WORKER_REGISTRATION_PREFIX: &str = "worker-registration/";
pub const ELECTION_PREFIX: &str = "election/";
pub const RUNNING_PREFIX: &str = "running/";

pub fn desired_task(key: &TaskKey) -> String {
    format!("{DESIRED_TASK_PREFIX}{key}")
}

pub fn placement(key: &TaskKey) -> String {
    format!("{PLACEMENT_PREFIX}{key}")
}

pub fn node_load(strategy_kind: &str, node: &str) -> String {
    format!("{NODE_LOAD_PREFIX}{strategy_kind}/{node}")
}

pub fn worker_registration(strategy_kind: &str, node: &str) -> String {
    format!("{WORKER_REGISTRATION_PREFIX}{strategy_kind}/{node}")
}

pub fn election(name: &str) -> String {
    format!("{ELECTION_PREFIX}{name}")
}

pub fn running(key: &TaskKey) -> String {
    format!("{RUNNING_PREFIX}{key}")
}

/// Extract the task key from a `desired-task/`, `placement/` or
/// `running/` key.
pub fn task_key_of(prefix: &str, key: &str) -> Option<TaskKey> {
    key.strip_prefix(prefix)
        .filter(|rest| !rest.is_empty())
        .map(TaskKey::from_raw)
}

/// Split a `node-load/` or `worker-registration/` key into
/// `(strategy_kind, node)`.
pub fn kind_and_node<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix(prefix)?;
    let (kind, node) = rest.split_once('/')?;
    (!kind.is_empty() && !node.is_empty()).then_some((kind, node))
}
