//! End-to-end scheduler tests against an in-memory store.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use strat_core::config::SchedulerConfig;
use strat_core::keys;
use strat_core::{Credential, DesiredTask, NodeLoadRecord, PlacementRecord, WorkerRegistration, encode};
use stratgrid_scheduler::{Scheduler, TaskControl};
use stratgrid_store::{
    CoordinationStore, EmbeddedStore, LeaseId, RangeResult, Revision, SharedStore, StoreResult,
    WatchStream, get_json,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn store() -> SharedStore {
    Arc::new(EmbeddedStore::open_in_memory().unwrap())
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        op_timeout_ms: 2_000,
        leader_lease_ttl_secs: 3,
        ..SchedulerConfig::default()
    }
}

fn task(instrument: &str) -> DesiredTask {
    let credential = Credential {
        account: "acct".to_string(),
        api_key: "k".to_string(),
        secret: "s".to_string(),
        passphrase: None,
    };
    DesiredTask::new(credential, "grid", instrument, "wss://exchange", serde_json::json!({}))
}

async fn register(store: &SharedStore, node: &str, lease: Option<LeaseId>) {
    let record = WorkerRegistration {
        node: node.to_string(),
        strategy_kind: "grid".to_string(),
        registered_at: 0,
    };
    store
        .put(&keys::worker_registration("grid", node), encode(&record).unwrap(), lease)
        .await
        .unwrap();
}

/// Holds every placement write back by `delay` and counts the writes that
/// land outside the leadership term they started in.
struct TermCheckedStore {
    inner: SharedStore,
    election_key: String,
    delay: Duration,
    placement_writes: AtomicUsize,
    stale_writes: AtomicUsize,
}

impl TermCheckedStore {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: store(),
            election_key: keys::election(&config().election_name),
            delay,
            placement_writes: AtomicUsize::new(0),
            stale_writes: AtomicUsize::new(0),
        })
    }

    /// Lease of the current leadership term, if there is a leader.
    async fn term(&self) -> Option<LeaseId> {
        self.inner.get(&self.election_key).await.unwrap().and_then(|kv| kv.lease)
    }

    fn stale_writes(&self) -> usize {
        self.stale_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationStore for TermCheckedStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<Revision> {
        if key.starts_with(keys::PLACEMENT_PREFIX) {
            let started_in = self.term().await;
            tokio::time::sleep(self.delay).await;
            if started_in.is_none() || self.term().await != started_in {
                self.stale_writes.fetch_add(1, Ordering::SeqCst);
            }
            self.placement_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.put(key, value, lease).await
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<bool> {
        self.inner.create(key, value, lease).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<stratgrid_store::KeyValue>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn range(&self, prefix: &str) -> StoreResult<RangeResult> {
        self.inner.range(prefix).await
    }

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        self.inner.watch(prefix).await
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.inner.grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        self.inner.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.inner.revoke_lease(lease).await
    }
}

struct Running {
    scheduler: Arc<Scheduler>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

fn spawn_scheduler(store: &SharedStore) -> Running {
    let scheduler = Arc::new(Scheduler::new(store.clone(), &config()));
    let (shutdown, rx) = watch::channel(false);
    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.run(rx).await });
    Running {
        scheduler,
        shutdown,
        handle,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time: {what}");
}

async fn placements(store: &SharedStore) -> Vec<PlacementRecord> {
    store
        .range(keys::PLACEMENT_PREFIX)
        .await
        .unwrap()
        .kvs
        .iter()
        .map(|kv| kv.decode().unwrap())
        .collect()
}

async fn load(store: &SharedStore, node: &str) -> Option<NodeLoadRecord> {
    get_json(store.as_ref(), &keys::node_load("grid", node))
        .await
        .unwrap()
}

#[tokio::test]
async fn leader_converges_desired_tasks_onto_workers() {
    let store = store();
    let s = &store;
    register(&store, "a", None).await;
    register(&store, "b", None).await;
    let _scheduler = spawn_scheduler(&store);

    let control = TaskControl::new(store.clone(), Duration::from_secs(2));
    for instrument in ["BTC", "ETH", "SOL", "XRP"] {
        control.start_task(task(instrument)).await.unwrap();
    }

    eventually("all four tasks placed", move || async move {
        placements(s).await.len() == 4
    })
    .await;
    eventually("load split evenly", move || async move {
        let a = load(s, "a").await.map_or(0, |l| l.tasks.len());
        let b = load(s, "b").await.map_or(0, |l| l.tasks.len());
        a == 2 && b == 2
    })
    .await;

    let key = task("BTC").key;
    let k = &key;
    control.stop_task(&key).await.unwrap();
    eventually("stopped task unplaced", move || async move {
        placements(s).await.iter().all(|p| p.task_key != *k)
    })
    .await;
}

#[tokio::test]
async fn existing_state_is_reconciled_on_takeover() {
    let store = store();
    let s = &store;
    register(&store, "a", None).await;
    let control = TaskControl::new(store.clone(), Duration::from_secs(2));
    control.start_task(task("BTC")).await.unwrap();
    control.start_task(task("ETH")).await.unwrap();

    let _scheduler = spawn_scheduler(&store);
    eventually("pre-existing tasks placed", move || async move {
        placements(s).await.len() == 2
    })
    .await;
}

#[tokio::test]
async fn worker_loss_moves_its_tasks() {
    let store = store();
    let s = &store;
    let lease = store.grant_lease(Duration::from_secs(30)).await.unwrap();
    register(&store, "a", None).await;
    register(&store, "b", Some(lease)).await;
    let _scheduler = spawn_scheduler(&store);

    let control = TaskControl::new(store.clone(), Duration::from_secs(2));
    for instrument in ["BTC", "ETH", "SOL", "XRP"] {
        control.start_task(task(instrument)).await.unwrap();
    }
    eventually("tasks spread over both nodes", move || async move {
        load(s, "b").await.is_some_and(|l| l.tasks.len() == 2)
    })
    .await;

    store.revoke_lease(lease).await.unwrap();

    eventually("b emptied and forgotten", move || async move {
        let all = placements(s).await;
        all.len() == 4 && all.iter().all(|p| p.node == "a") && load(s, "b").await.is_none()
    })
    .await;
    eventually("a carries everything", move || async move {
        load(s, "a").await.is_some_and(|l| l.tasks.len() == 4)
    })
    .await;
}

#[tokio::test]
async fn only_one_scheduler_leads_and_another_takes_over() {
    let checked = TermCheckedStore::new(Duration::from_millis(20));
    let store: SharedStore = checked.clone();
    let s = &store;
    register(&store, "a", None).await;
    let first = spawn_scheduler(&store);
    let second = spawn_scheduler(&store);
    let election = first.scheduler.election().clone();

    let leader = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(leader) = election.leader().await.unwrap() {
                break leader;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("a leader is elected");
    let ids = [first.scheduler.identity(), second.scheduler.identity()];
    assert!(ids.contains(&leader.as_str()));

    let (active, standby) = if leader == first.scheduler.identity() {
        (first, second)
    } else {
        (second, first)
    };

    active.shutdown.send(true).unwrap();
    active.handle.await.unwrap();

    let standby_id = standby.scheduler.identity().to_string();
    let (election, standby_id) = (&election, standby_id.as_str());
    eventually("standby takes over", move || async move {
        election.leader().await.unwrap().as_deref() == Some(standby_id)
    })
    .await;

    let control = TaskControl::new(store.clone(), Duration::from_secs(2));
    control.start_task(task("BTC")).await.unwrap();
    eventually("new leader places work", move || async move {
        placements(s).await.len() == 1
    })
    .await;
    assert_eq!(checked.stale_writes(), 0);
}

#[tokio::test]
async fn placement_step_stops_when_leadership_ends() {
    let checked = TermCheckedStore::new(Duration::from_millis(300));
    let store: SharedStore = checked.clone();
    let s = &store;
    let control = TaskControl::new(store.clone(), Duration::from_secs(2));
    for instrument in ["BTC", "ETH", "SOL", "XRP", "ADA", "DOT"] {
        control.start_task(task(instrument)).await.unwrap();
    }

    let _scheduler = spawn_scheduler(&store);
    let checked_ref = &checked;
    eventually("a leader is elected", move || async move { checked_ref.term().await.is_some() }).await;

    // The new worker makes the leader place all six tasks, one slow write at a time.
    register(&store, "a", None).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let term = checked.term().await.unwrap();
    store.revoke_lease(term).await.unwrap();

    eventually("next term places everything", move || async move {
        placements(s).await.len() == 6
    })
    .await;
    eventually("load matches placements", move || async move {
        load(s, "a").await.is_some_and(|l| l.tasks.len() == 6)
    })
    .await;
    assert_eq!(checked.stale_writes(), 0);
}
