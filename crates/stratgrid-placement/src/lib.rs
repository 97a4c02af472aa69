//! StratGrid placement: where does a task go?
//!
//! This crate answers placement questions for the scheduler. It does NOT
//! write placements (that's `stratgrid-scheduler`). Instead, it mirrors
//! worker registrations and node load from the store and picks nodes.
//!
//! # Components
//!
//! - **`cache`**: Node registry cache actor, published as immutable snapshots
//! - **`placer`**: Least-loaded node selection over a snapshot
//! - **`error`**: Placement errors

pub mod cache;
pub mod error;
pub mod placer;

pub use cache::{NodeCache, NodeSnapshot};
pub use error::{PlacementError, PlacementResult};
pub use placer::least_loaded;
