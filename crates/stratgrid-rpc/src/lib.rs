//! stratgrid-rpc: the coordination store over gRPC.
//!
//! Nodes that do not embed the store reach it through this crate:
//!
//! - **`server`**: `StoreService` exposes any [`CoordinationStore`] as the
//!   `stratgrid.store.Store` gRPC service
//! - **`client`**: `RemoteStore` implements [`CoordinationStore`] against
//!   one or more store endpoints, balancing across them
//! - **`messages`**: prost wire types
//!
//! [`CoordinationStore`]: stratgrid_store::CoordinationStore

pub mod client;
pub mod messages;
pub mod server;

/// Generated gRPC service stubs.
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/stratgrid.store.Store.rs"));
}

pub use client::RemoteStore;
pub use server::{StoreService, serve};
