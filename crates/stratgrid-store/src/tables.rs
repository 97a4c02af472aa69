//! redb table definitions for the embedded store.
//!
//! Values in `KV` are JSON-serialized [`KeyValue`](crate::types::KeyValue)
//! entries so the modification revision and owning lease travel with the
//! payload.

use redb::TableDefinition;

/// Application keys (`desired-task/…`, `placement/…`, …).
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Store metadata (currently just the revision counter).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const REVISION_KEY: &str = "revision";
