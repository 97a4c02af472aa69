//! stratgrid-store: the coordination store behind StratGrid.
//!
//! All scheduler and supervisor state is anchored in a strongly consistent
//! key-value store exposing:
//!
//! - put / create-if-absent / get / delete and prefix range reads
//! - a prefix watch feed of mutations
//! - time-bound leases with keep-alive and revoke; leased keys vanish when
//!   their lease ends
//! - leader election built on the above (`election`)
//!
//! [`CoordinationStore`] is the seam. [`EmbeddedStore`] implements it on top
//! of [redb](https://docs.rs/redb) for a single process; `stratgrid-rpc`
//! serves that same store over gRPC and provides a remote client.
//!
//! # Architecture
//!
//! ```text
//! EmbeddedStore
//!   ├── redb Database (kv table + meta table holding the revision)
//!   ├── LeaseTable (in memory; leases never survive a restart)
//!   └── broadcast::Sender<WatchEvent> ─┬─ watcher "placement/"
//!                                      └─ watcher "node-load/" ...
//! ```

pub mod election;
pub mod embedded;
pub mod error;
pub mod lease;
pub mod store;
pub mod tables;
pub mod types;

pub use election::{Election, Leadership};
pub use embedded::EmbeddedStore;
pub use error::{StoreError, StoreResult};
pub use lease::LeaseKeeper;
pub use store::{CoordinationStore, SharedStore, get_json, put_json};
pub use types::*;
