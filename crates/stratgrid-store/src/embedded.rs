//! EmbeddedStore: redb-backed coordination store for a single process.
//!
//! Keys and the revision counter are persisted in redb. Leases live only in
//! memory: keys bound to a lease are dropped when the store is reopened, just
//! as they would be after the lease expired.
//!
//! Every mutation runs under one mutex that also owns the lease table, so the
//! revision sequence and the order of broadcast watch events always agree.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::CoordinationStore;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Broadcast capacity shared by all watchers.
const WATCH_BUFFER: usize = 1024;

/// Per-watcher queue between the broadcast and the consumer.
const FEED_BUFFER: usize = 256;

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct LeaseTable {
    revision: Revision,
    next_id: LeaseId,
    leases: HashMap<LeaseId, Lease>,
}

impl LeaseTable {
    fn is_live(&self, id: LeaseId, now: Instant) -> bool {
        self.leases.get(&id).is_some_and(|l| l.deadline > now)
    }

    fn attach(&mut self, id: LeaseId, key: &str) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.keys.insert(key.to_string());
        }
    }

    fn detach(&mut self, id: LeaseId, key: &str) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.keys.remove(key);
        }
    }
}

struct Inner {
    db: Database,
    leases: Mutex<LeaseTable>,
    events: broadcast::Sender<WatchEvent>,
}

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct EmbeddedStore {
    inner: Arc<Inner>,
}

impl EmbeddedStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db, WATCH_BUFFER)?;
        debug!(?path, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing and single-node use).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::in_memory_with_watch_buffer(WATCH_BUFFER)
    }

    fn in_memory_with_watch_buffer(watch_buffer: usize) -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db, watch_buffer)?;
        debug!("in-memory coordination store opened");
        Ok(store)
    }

    fn from_database(db: Database, watch_buffer: usize) -> StoreResult<Self> {
        let revision = init_tables(&db)?;
        let (events, _) = broadcast::channel(watch_buffer);
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                leases: Mutex::new(LeaseTable {
                    revision,
                    next_id: initial_lease_id(),
                    leases: HashMap::new(),
                }),
                events,
            }),
        })
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    /// Revoke every lease whose deadline has passed. Returns how many ended.
    pub fn reap_expired(&self) -> StoreResult<usize> {
        let mut leases = self.lock();
        let now = Instant::now();
        let expired: Vec<LeaseId> = leases
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.revoke_locked(&mut leases, *id)?;
            info!(lease = id, "lease expired");
        }
        Ok(expired.len())
    }

    /// Periodically expire leases until `shutdown` fires.
    pub async fn run_lease_reaper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_expired() {
                        warn!(error = %e, "lease reaper error");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("lease reaper shutting down");
                    break;
                }
            }
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, LeaseTable> {
        self.inner
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_entry(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let kv: KeyValue =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(kv))
            }
            None => Ok(None),
        }
    }

    /// Write `key`; with `only_if_absent` an existing key is left untouched
    /// and `None` is returned.
    fn write_locked(
        &self,
        leases: &mut LeaseTable,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        only_if_absent: bool,
    ) -> StoreResult<Option<Revision>> {
        if let Some(id) = lease {
            if !leases.is_live(id, Instant::now()) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        let revision = leases.revision + 1;
        let entry = KeyValue {
            key: key.to_string(),
            value,
            mod_revision: revision,
            lease,
        };
        let encoded = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;

        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let previous_lease;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            let previous: Option<KeyValue> = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| serde_json::from_slice(guard.value()))
                .transpose()
                .map_err(map_err!(Deserialize))?;
            if only_if_absent && previous.is_some() {
                return Ok(None);
            }
            previous_lease = previous.and_then(|p| p.lease);
            table
                .insert(key, encoded.as_slice())
                .map_err(map_err!(Write))?;

            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(REVISION_KEY, revision)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        leases.revision = revision;
        if let Some(old) = previous_lease.filter(|old| Some(*old) != lease) {
            leases.detach(old, key);
        }
        if let Some(id) = lease {
            leases.attach(id, key);
        }
        // No receivers is not an error.
        let _ = self.inner.events.send(WatchEvent::Put(entry));
        Ok(Some(revision))
    }

    fn delete_locked(&self, leases: &mut LeaseTable, key: &str) -> StoreResult<bool> {
        let revision = leases.revision + 1;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let removed: Option<KeyValue>;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            removed = table
                .remove(key)
                .map_err(map_err!(Write))?
                .map(|guard| serde_json::from_slice(guard.value()))
                .transpose()
                .map_err(map_err!(Deserialize))?;
            if removed.is_none() {
                return Ok(false);
            }
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(REVISION_KEY, revision)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        leases.revision = revision;
        if let Some(id) = removed.and_then(|kv| kv.lease) {
            leases.detach(id, key);
        }
        let _ = self.inner.events.send(WatchEvent::Delete {
            key: key.to_string(),
            revision,
        });
        Ok(true)
    }

    fn revoke_locked(&self, leases: &mut LeaseTable, id: LeaseId) -> StoreResult<()> {
        let lease = leases
            .leases
            .remove(&id)
            .ok_or(StoreError::LeaseNotFound(id))?;
        for key in &lease.keys {
            self.delete_locked(leases, key)?;
        }
        debug!(lease = id, keys = lease.keys.len(), "lease revoked");
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for EmbeddedStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<Revision> {
        let mut leases = self.lock();
        let revision = self.write_locked(&mut leases, key, value, lease, false)?;
        // An unconditional write always produces a revision.
        Ok(revision.unwrap_or(leases.revision))
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<bool> {
        let mut leases = self.lock();
        Ok(self
            .write_locked(&mut leases, key, value, lease, true)?
            .is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.read_entry(key)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut leases = self.lock();
        self.delete_locked(&mut leases, key)
    }

    async fn range(&self, prefix: &str) -> StoreResult<RangeResult> {
        // Hold the lock so the revision matches the rows read.
        let leases = self.lock();
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut kvs = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let kv: KeyValue =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                kvs.push(kv);
            }
        }
        Ok(RangeResult {
            revision: leases.revision,
            kvs,
        })
    }

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut events = self.inner.events.subscribe();
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            if event.key().starts_with(&prefix) && tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(%prefix, missed, "watcher fell behind, closing feed");
                            let _ = tx.send(Err(StoreError::WatchLagged(missed))).await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut leases = self.lock();
        let id = leases.next_id;
        leases.next_id += 1;
        leases.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        debug!(lease = id, ?ttl, "lease granted");
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        let mut leases = self.lock();
        let now = Instant::now();
        match leases.leases.get_mut(&lease) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = now + entry.ttl;
                Ok(())
            }
            Some(_) => {
                self.revoke_locked(&mut leases, lease)?;
                Err(StoreError::LeaseNotFound(lease))
            }
            None => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        let mut leases = self.lock();
        self.revoke_locked(&mut leases, lease)
    }
}

/// Create tables, load the revision, and drop keys bound to leases from a
/// previous run.
fn init_tables(db: &Database) -> StoreResult<Revision> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    let revision;
    {
        let mut kv = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        let mut current = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);

        let stale: Vec<String> = kv
            .iter()
            .map_err(map_err!(Read))?
            .filter_map(|entry| {
                let (key, value) = entry.ok()?;
                let stored: KeyValue = serde_json::from_slice(value.value()).ok()?;
                stored.lease.is_some().then(|| key.value().to_string())
            })
            .collect();

        for key in &stale {
            kv.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        if !stale.is_empty() {
            current += 1;
            meta.insert(REVISION_KEY, current)
                .map_err(map_err!(Write))?;
            debug!(count = stale.len(), "dropped leased keys from a previous run");
        }
        revision = current;
    }
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(revision)
}

/// Lease ids start from the wall clock so ids handed out before a restart
/// are not reused by the next run.
fn initial_lease_id() -> LeaseId {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    millis.saturating_mul(1_000).max(1)
}
