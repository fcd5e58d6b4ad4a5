//! Raft consensus for the blockfs metadata service.
//!
//! The metadata service replicates its whole state as opaque blobs. This module
//! elects a leader among the metadata replicas, replicates and persists the log,
//! and feeds committed entries to a [`StateMachine`] plugin. Proposals complete
//! only after the entry has been committed and applied locally.

// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod handle;
mod log;
mod node;
pub mod rpc;
mod state;
mod storage;

pub use handle::{RaftHandle, RaftStatus};
pub use log::{LogEntry, RaftLog};
pub use node::{RaftCommand, RaftConfig, RaftNode};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{NodeState, PersistentState, RaftState};
pub use storage::{RaftStorage, SnapshotMeta};

use crate::types::LogIndex;

/// Trait for state machines that can be driven by Raft.
///
/// Empty payloads are reserved for the leader's no-op entry and never reach `apply`.
pub trait StateMachine: Send + Sync {
    /// Apply a committed command.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> crate::Result<()>;

    /// Serialize the current state.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the current state with a snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> crate::Result<()>;
}
