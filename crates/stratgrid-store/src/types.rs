//! Value types exchanged with the coordination store.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};

/// Monotonic store revision; bumped by every mutation.
pub type Revision = u64;

/// Identifier of a granted lease.
pub type LeaseId = u64;

/// A stored key with its value and bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the last write to this key.
    pub mod_revision: Revision,
    /// Lease the key is bound to, if any.
    pub lease: Option<LeaseId>,
}

impl KeyValue {
    /// Deserialize the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_slice(&self.value).map_err(|e| StoreError::Deserialize(e.to_string()))
    }
}

/// One mutation observed on a watch feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, revision: Revision },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> Revision {
        match self {
            WatchEvent::Put(kv) => kv.mod_revision,
            WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

/// Consistent prefix snapshot.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    /// Store revision the snapshot was taken at.
    pub revision: Revision,
    pub kvs: Vec<KeyValue>,
}

/// Live feed of mutations under a prefix.
///
/// An `Err` item means the feed is broken (e.g. the watcher lagged); the
/// sender closes right after it, and the consumer must re-snapshot.
pub type WatchStream = mpsc::Receiver<StoreResult<WatchEvent>>;
