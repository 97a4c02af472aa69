//! Scheduler: the leader-elected control loop.
//!
//! Every node may run a `Scheduler`; only the election winner acts. While
//! leading it runs:
//!
//! - the node cache actor (`node-load/` + `worker-registration/` mirror)
//! - a desired-task feed loop
//! - a worker-registration feed loop
//! - an observer on the election key
//!
//! All of them share one stop signal. Losing the lease, or observing the
//! election key gone or naming another identity, stops them (steps in flight
//! included) and the scheduler campaigns again.

use std::sync::Arc;
use std::time::Duration;

use strat_core::config::SchedulerConfig;
use strat_core::keys::{DESIRED_TASK_PREFIX, WORKER_REGISTRATION_PREFIX};
use stratgrid_placement::NodeCache;
use stratgrid_store::{Election, Leadership, SharedStore};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::reconcile::Reconciler;

/// Delay before campaigning again after a failed campaign.
const CAMPAIGN_RETRY: Duration = Duration::from_secs(1);

/// Delay before re-subscribing a lost feed.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(200);

/// How a leadership term ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermEnd {
    Lost,
    Shutdown,
}

/// The store feeds a leader follows.
#[derive(Debug, Clone, Copy)]
enum Feed {
    DesiredTasks,
    Registrations,
}

impl Feed {
    fn prefix(self) -> &'static str {
        match self {
            Feed::DesiredTasks => DESIRED_TASK_PREFIX,
            Feed::Registrations => WORKER_REGISTRATION_PREFIX,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Feed::DesiredTasks => "desired-tasks",
            Feed::Registrations => "worker-registrations",
        }
    }
}

/// Leader-elected scheduler.
pub struct Scheduler {
    store: SharedStore,
    election: Election,
    identity: String,
    op_timeout: Duration,
}

impl Scheduler {
    /// Create a scheduler with a fresh random identity.
    pub fn new(store: SharedStore, config: &SchedulerConfig) -> Self {
        let election = Election::new(store.clone(), &config.election_name, config.leader_lease_ttl());
        Self {
            store,
            election,
            identity: Uuid::new_v4().to_string(),
            op_timeout: config.op_timeout(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    /// Campaign and lead until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            debug!(identity = %self.identity, "campaigning for scheduler leadership");

            let campaign = tokio::select! {
                result = self.election.campaign(&self.identity) => result,
                _ = shutdown.changed() => break,
            };
            let leadership = match campaign {
                Ok(leadership) => leadership,
                Err(e) => {
                    warn!(error = %e, "scheduler campaign failed");
                    tokio::select! {
                        _ = tokio::time::sleep(CAMPAIGN_RETRY) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            info!(identity = %self.identity, "scheduler leadership acquired");
            let end = self.lead(&leadership, &mut shutdown).await;
            if let Err(e) = leadership.resign().await {
                warn!(error = %e, "failed to resign scheduler leadership");
            }

            match end {
                TermEnd::Shutdown => break,
                TermEnd::Lost => warn!(identity = %self.identity, "scheduler leadership lost"),
            }
        }
        info!(identity = %self.identity, "scheduler stopped");
    }

    /// Run the leader loops until leadership ends.
    async fn lead(&self, leadership: &Leadership, shutdown: &mut watch::Receiver<bool>) -> TermEnd {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (cache, cache_task) = NodeCache::spawn(self.store.clone(), stop_rx.clone());
        let reconciler = Arc::new(Mutex::new(Reconciler::new(
            self.store.clone(),
            cache,
            self.op_timeout,
        )));

        let mut loops = JoinSet::new();
        for feed in [Feed::DesiredTasks, Feed::Registrations] {
            loops.spawn(run_feed(
                feed,
                self.store.clone(),
                reconciler.clone(),
                stop_rx.clone(),
            ));
        }

        let mut observer = self.election.observe();
        let end = loop {
            tokio::select! {
                changed = observer.changed() => {
                    if changed.is_err() {
                        break TermEnd::Lost;
                    }
                    let leader = observer.borrow_and_update().clone();
                    match leader {
                        Some(leader) if leader == self.identity => {}
                        Some(leader) => {
                            warn!(%leader, "election key names another scheduler");
                            break TermEnd::Lost;
                        }
                        None => {
                            warn!("election key gone");
                            break TermEnd::Lost;
                        }
                    }
                }
                _ = leadership.lost() => break TermEnd::Lost,
                _ = shutdown.changed() => break TermEnd::Shutdown,
            }
        };

        let _ = stop_tx.send(true);
        while loops.join_next().await.is_some() {}
        let _ = cache_task.await;
        debug!(?end, "leader loops stopped");
        end
    }
}

/// Follow one feed and apply its events. The desired-task feed runs a full
/// pass when it starts; either feed runs one after losing events.
async fn run_feed(
    feed: Feed,
    store: SharedStore,
    reconciler: Arc<Mutex<Reconciler>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut resubscribed = false;
    loop {
        let mut events = match store.watch(feed.prefix()).await {
            Ok(events) => events,
            Err(e) => {
                warn!(feed = feed.name(), error = %e, "failed to subscribe");
                resubscribed = true;
                tokio::select! {
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    _ = stop.changed() => return,
                }
            }
        };

        if resubscribed || matches!(feed, Feed::DesiredTasks) {
            let pass = tokio::select! {
                result = async { reconciler.lock().await.reconcile_all().await } => result,
                _ = stop.changed() => return,
            };
            if let Err(e) = pass {
                warn!(feed = feed.name(), error = %e, "reconciliation pass abandoned");
            }
        }

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = stop.changed() => return,
            };
            match event {
                Some(Ok(event)) => {
                    // Dropped mid-step the moment leadership ends.
                    let step = async {
                        let reconciler = reconciler.lock().await;
                        match feed {
                            Feed::DesiredTasks => reconciler.on_desired_event(event).await,
                            Feed::Registrations => reconciler.on_registration_event(event).await,
                        }
                    };
                    let result = tokio::select! {
                        result = step => result,
                        _ = stop.changed() => return,
                    };
                    if let Err(e) = result {
                        warn!(feed = feed.name(), error = %e, "reconciliation step abandoned");
                    }
                }
                Some(Err(e)) => {
                    warn!(feed = feed.name(), error = %e, "feed lost, resubscribing");
                    break;
                }
                None => {
                    warn!(feed = feed.name(), "feed closed, resubscribing");
                    break;
                }
            }
        }

        resubscribed = true;
        tokio::select! {
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            _ = stop.changed() => return,
        }
    }
}
