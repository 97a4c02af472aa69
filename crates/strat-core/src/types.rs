//! Shared types used across StratGrid crates.
//!
//! Every record stored in the coordination store is JSON-serialized; the
//! helpers [`encode`] and [`decode`] keep that choice in one place.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Address of a worker node (`host:port` of its HTTP listener).
pub type NodeAddr = String;

/// Name of a strategy implementation, e.g. `"grid"`.
pub type StrategyKind = String;

// ── Task identity ─────────────────────────────────────────────────

/// Identity of one strategy instance: credential + strategy + instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    /// Parts are escaped, so the key never contains `/` and `:` only
    /// appears as the separator.
    pub fn new(account: &str, strategy_kind: &str, instrument_id: &str) -> Self {
        Self(format!(
            "{}:{}:{}",
            escape_part(account),
            escape_part(strategy_kind),
            escape_part(instrument_id)
        ))
    }

    /// Rebuild a key from its string form (as found in store keys).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short, filesystem-safe digest of the key.
    ///
    /// Used to name per-task control endpoints without leaking account
    /// identifiers into socket paths.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..8])
    }
}

fn escape_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }
    escaped
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exchange credential bound to a task.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Account identifier; part of the task key.
    pub account: String,
    pub api_key: String,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account", &self.account)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ── Records ───────────────────────────────────────────────────────

/// A task the system should be running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredTask {
    pub key: TaskKey,
    pub credential: Credential,
    pub strategy_kind: StrategyKind,
    pub instrument_id: String,
    /// Exchange endpoint the strategy talks to.
    pub endpoint: String,
    /// Opaque strategy parameters.
    #[serde(default)]
    pub params: serde_json::Value,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DesiredTask {
    pub fn new(
        credential: Credential,
        strategy_kind: &str,
        instrument_id: &str,
        endpoint: &str,
        params: serde_json::Value,
    ) -> Self {
        let now = epoch_secs();
        Self {
            key: TaskKey::new(&credential.account, strategy_kind, instrument_id),
            credential,
            strategy_kind: strategy_kind.to_string(),
            instrument_id: instrument_id.to_string(),
            endpoint: endpoint.to_string(),
            params,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Which node currently runs a desired task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub task_key: TaskKey,
    pub node: NodeAddr,
    pub strategy_kind: StrategyKind,
    pub placed_at: u64,
}

/// Task set currently attributed to one node for one strategy kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLoadRecord {
    pub node: NodeAddr,
    pub strategy_kind: StrategyKind,
    #[serde(default)]
    pub tasks: BTreeSet<TaskKey>,
}

impl NodeLoadRecord {
    pub fn empty(strategy_kind: &str, node: &str) -> Self {
        Self {
            node: node.to_string(),
            strategy_kind: strategy_kind.to_string(),
            tasks: BTreeSet::new(),
        }
    }
}

/// A live worker node able to run one strategy kind. Bound to a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub node: NodeAddr,
    pub strategy_kind: StrategyKind,
    pub registered_at: u64,
}

/// Written by a supervisor while its task is confirmed running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningMarker {
    pub task_key: TaskKey,
    pub node: NodeAddr,
    pub pid: Option<u32>,
    pub since: u64,
}

// ── Encoding ──────────────────────────────────────────────────────

/// Serialize a record for storage.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// Deserialize a stored record.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential {
            account: "acct-7".to_string(),
            api_key: "key".to_string(),
            secret: "hunter2".to_string(),
            passphrase: None,
        }
    }

    #[test]
    fn task_key_combines_identity_parts() {
        let key = TaskKey::new("acct-7", "grid", "BTC-USDT");
        assert_eq!(key.as_str(), "acct-7:grid:BTC-USDT");
        assert_eq!(key.to_string(), "acct-7:grid:BTC-USDT");
    }

    #[test]
    fn task_key_escapes_separators() {
        let key = TaskKey::new("acct-7", "grid", "BTC/USDT");
        assert_eq!(key.as_str(), "acct-7:grid:BTC%2FUSDT");
        assert!(!key.as_str().contains('/'));

        assert_ne!(TaskKey::new("a:b", "grid", "X"), TaskKey::new("a", "b:grid", "X"));
        assert_ne!(TaskKey::new("a%3A", "grid", "X"), TaskKey::new("a:", "grid", "X"));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = TaskKey::new("acct-7", "grid", "BTC-USDT");
        let b = TaskKey::new("acct-7", "grid", "BTC-USDT");
        let c = TaskKey::new("acct-7", "grid", "ETH-USDT");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
        assert!(!a.fingerprint().contains("acct"));
    }

    #[test]
    fn desired_task_derives_key_from_credential() {
        let task = DesiredTask::new(
            credential(),
            "grid",
            "BTC-USDT",
            "wss://exchange.example",
            serde_json::json!({"levels": 10}),
        );
        assert_eq!(task.key, TaskKey::new("acct-7", "grid", "BTC-USDT"));
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn credential_debug_redacts_secrets() {
        let rendered = format!("{:?}", credential());
        assert!(rendered.contains("acct-7"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn node_load_record_serializes_task_set() {
        let mut record = NodeLoadRecord::empty("grid", "10.0.0.1:7000");
        record.tasks.insert(TaskKey::new("a", "grid", "X"));
        let bytes = encode(&record).unwrap();
        let back: NodeLoadRecord = decode(&bytes).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn epoch_secs_is_recent() {
        assert!(epoch_secs() > 1_704_067_200);
    }
}
