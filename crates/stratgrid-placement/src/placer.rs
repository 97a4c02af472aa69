//! Placement engine: picks the node for a task.
//!
//! Placement is a pure function of the strategy kind and a cache snapshot:
//! among nodes registered for the kind, the one with the fewest tasks wins.
//! A registered node without a load record counts as empty. Ties go to the
//! first node in cache order.

use strat_core::NodeAddr;
use tracing::debug;

use crate::cache::NodeSnapshot;
use crate::error::{PlacementError, PlacementResult};

/// Choose the least-loaded registered node for `strategy_kind`.
pub fn least_loaded(strategy_kind: &str, snapshot: &NodeSnapshot) -> PlacementResult<NodeAddr> {
    let chosen = snapshot
        .nodes_for(strategy_kind)
        .map(|node| (node, snapshot.load_of(strategy_kind, node)))
        .min_by_key(|(_, load)| *load);

    match chosen {
        Some((node, load)) => {
            debug!(strategy_kind, %node, load, "selected least-loaded node");
            Ok(node.clone())
        }
        None => Err(PlacementError::NoEligibleNode(strategy_kind.to_string())),
    }
}
