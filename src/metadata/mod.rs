//! Metadata service for blockfs.
//!
//! A group of replicas agrees on one [`MetadataState`] through Raft: the file
//! namespace, the registered chunk servers and every block's replica set.
//! The leader serves mutations and watches chunk servers; followers answer
//! read-only calls from a periodically refreshed copy.

// Deny unsafe code patterns in this critical metadata module.
// Panics in metadata operations can cause data inconsistency.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod migration;
mod namespace;
pub mod operations;
mod replicas;
mod server;
mod service;
mod state;
mod state_machine;

pub use migration::MigrationReport;
pub use namespace::{FileEntry, Namespace};
pub use replicas::{ChunkServerInfo, ReplicaDirectory, ReplicaSet};
pub use server::{MetadataServer, NetworkRpc};
pub use service::MetadataService;
pub use state::{BlockAddrs, MetadataState};
pub use state_machine::MetadataStateMachine;
