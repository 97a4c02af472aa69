//! Node integration tests.
//!
//! Assembles scheduler, worker agents, and the HTTP API in-process on a
//! shared in-memory store. Strategy processes are real `stratd runner`
//! children, so placement, supervision, crash recovery, and exec
//! forwarding are exercised end to end.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use strat_core::config::{AgentConfig, SchedulerConfig, SupervisorConfig};
use strat_core::keys;
use strat_core::{Credential, DesiredTask, PlacementRecord, RunningMarker, TaskKey};
use stratgrid_agent::WorkerAgent;
use stratgrid_scheduler::{Scheduler, TaskControl};
use stratgrid_store::{EmbeddedStore, SharedStore, get_json};
use stratgrid_supervisor::{RunnerLauncher, SupervisorContext};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const STRATD: &str = env!("CARGO_BIN_EXE_stratd");

struct Node {
    addr: String,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    _sockets: tempfile::TempDir,
}

impl Node {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for handle in self.handles {
            handle.await.unwrap();
        }
    }
}

async fn start_node(store: &SharedStore) -> Node {
    let sockets = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let ctx = SupervisorContext {
        store: store.clone(),
        launcher: Arc::new(RunnerLauncher::new(STRATD, vec!["runner".to_string()])),
        node: addr.clone(),
        socket_dir: sockets.path().to_path_buf(),
        config: SupervisorConfig {
            start_retry_ms: 50,
            restart_backoff_ms: 200,
            lease_ttl_secs: 3,
            ..SupervisorConfig::default()
        },
    };
    let agent = WorkerAgent::new(
        ctx,
        vec!["grid".to_string()],
        &AgentConfig {
            registration_ttl_secs: 3,
        },
    );

    let (shutdown, rx) = watch::channel(false);
    let mut handles = Vec::new();

    let runner = agent.clone();
    let agent_shutdown = rx.clone();
    handles.push(tokio::spawn(async move { runner.run(agent_shutdown).await }));

    let control = TaskControl::new(store.clone(), Duration::from_secs(2));
    let router = stratgrid_api::build_router(control, Some(agent));
    let mut server_shutdown = rx;
    handles.push(tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
            .unwrap();
    }));

    Node {
        addr,
        shutdown,
        handles,
        _sockets: sockets,
    }
}

fn spawn_scheduler(store: &SharedStore) -> watch::Sender<bool> {
    let config = SchedulerConfig {
        op_timeout_ms: 2_000,
        leader_lease_ttl_secs: 3,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(store.clone(), &config);
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move { scheduler.run(rx).await });
    tx
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

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time: {what}");
}

async fn marker(store: &SharedStore, key: &TaskKey) -> Option<RunningMarker> {
    get_json(store.as_ref(), &keys::running(key)).await.unwrap()
}

async fn placement(store: &SharedStore, key: &TaskKey) -> Option<PlacementRecord> {
    get_json(store.as_ref(), &keys::placement(key)).await.unwrap()
}

fn store() -> SharedStore {
    Arc::new(EmbeddedStore::open_in_memory().unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn task_runs_and_accepts_commands() {
    let store = store();
    let node = start_node(&store).await;
    let _scheduler = spawn_scheduler(&store);
    let control = TaskControl::new(store.clone(), Duration::from_secs(5));

    let key = control.start_task(task("BTC")).await.unwrap();
    let (s, k, addr) = (&store, &key, &node.addr);
    eventually("task running on the node", move || async move {
        marker(s, k).await.is_some_and(|m| &m.node == addr)
    })
    .await;

    let routed_to = control
        .exec(&key, serde_json::json!({"rebalance": true}))
        .await
        .unwrap();
    assert_eq!(routed_to, node.addr);

    control.stop_task(&key).await.unwrap();
    eventually("task torn down", move || async move {
        placement(s, k).await.is_none() && marker(s, k).await.is_none()
    })
    .await;

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn killed_runner_is_replaced() {
    let store = store();
    let node = start_node(&store).await;
    let _scheduler = spawn_scheduler(&store);
    let control = TaskControl::new(store.clone(), Duration::from_secs(5));

    let key = control.start_task(task("ETH")).await.unwrap();
    let (s, k) = (&store, &key);
    eventually("task running", move || async move { marker(s, k).await.is_some() }).await;
    let first = marker(s, k).await.and_then(|m| m.pid).unwrap();

    unsafe { libc::kill(first as libc::pid_t, libc::SIGKILL) };

    eventually("new runner confirmed", move || async move {
        marker(s, k)
            .await
            .and_then(|m| m.pid)
            .is_some_and(|pid| pid != first)
    })
    .await;
    control
        .exec(&key, serde_json::json!({"after": "restart"}))
        .await
        .unwrap();

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_a_node_moves_its_tasks() {
    let store = store();
    let a = start_node(&store).await;
    let b = start_node(&store).await;
    let _scheduler = spawn_scheduler(&store);
    let control = TaskControl::new(store.clone(), Duration::from_secs(5));

    let mut keys = Vec::new();
    for instrument in ["BTC", "ETH", "SOL", "XRP"] {
        keys.push(control.start_task(task(instrument)).await.unwrap());
    }
    let (s, ks) = (&store, &keys);
    let b_addr = b.addr.clone();
    let on_b_addr = &b_addr;
    eventually("tasks running on both nodes", move || async move {
        let mut on_b = 0;
        for key in ks {
            match marker(s, key).await {
                Some(m) if &m.node == on_b_addr => on_b += 1,
                Some(_) => {}
                None => return false,
            }
        }
        on_b > 0
    })
    .await;

    b.stop().await;

    let a_addr = &a.addr;
    eventually("every task running on the remaining node", move || async move {
        for key in ks {
            if !marker(s, key).await.is_some_and(|m| &m.node == a_addr) {
                return false;
            }
        }
        true
    })
    .await;

    a.stop().await;
}
