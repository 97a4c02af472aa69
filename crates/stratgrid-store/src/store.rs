//! The `CoordinationStore` trait and JSON helpers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StoreError, StoreResult};
use crate::types::{KeyValue, LeaseId, RangeResult, Revision, WatchStream};

/// Strongly consistent KV service with watches and leases.
///
/// Implementations must deliver watch events in revision order and must
/// delete every key bound to a lease when that lease is revoked or expires.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Insert or overwrite `key`, optionally binding it to `lease`.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<Revision>;

    /// Insert `key` only if it does not exist. Returns whether it was created.
    async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Delete `key`. Returns true if it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// All keys starting with `prefix`, with the revision they were read at.
    async fn range(&self, prefix: &str) -> StoreResult<RangeResult>;

    /// Subscribe to mutations of keys starting with `prefix`.
    ///
    /// Only mutations committed after this call returns are delivered.
    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream>;

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Refresh a lease. Fails with [`StoreError::LeaseNotFound`] once it
    /// has expired.
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()>;

    /// End a lease and delete every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;
}

/// Handle shared between actors.
pub type SharedStore = Arc<dyn CoordinationStore>;

/// Read and decode a JSON record.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(kv) => Ok(Some(kv.decode()?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON record.
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn CoordinationStore,
    key: &str,
    value: &T,
    lease: Option<LeaseId>,
) -> StoreResult<Revision> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialize(e.to_string()))?;
    store.put(key, bytes, lease).await
}
