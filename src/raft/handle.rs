//! Cloneable front end to a running [`RaftNode`](super::RaftNode).

use super::rpc::*;
use super::RaftCommand;
use crate::error::{BlockFsError, Result};
use crate::types::{LogIndex, NodeId, Term};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Point-in-time view of a node's role and progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<RaftCommand>,
}

impl RaftHandle {
    pub fn new(tx: mpsc::Sender<RaftCommand>) -> Self {
        Self { tx }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RaftCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| BlockFsError::Internal("raft node stopped".into()))?;
        rx.await
            .map_err(|_| BlockFsError::Internal("raft node dropped the request".into()))
    }

    pub async fn status(&self) -> Result<RaftStatus> {
        self.call(|response| RaftCommand::Status { response }).await
    }

    pub async fn is_leader(&self) -> bool {
        self.status().await.map(|s| s.is_leader).unwrap_or(false)
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.status().await.ok().and_then(|s| s.leader_id)
    }

    /// Replicate `data` and wait until it has been applied locally.
    pub async fn propose(&self, data: Vec<u8>, wait: Duration) -> Result<LogIndex> {
        let call = self.call(|response| RaftCommand::Propose { data, response });
        match tokio::time::timeout(wait, call).await {
            Ok(result) => result?,
            Err(_) => Err(BlockFsError::Timeout(format!(
                "proposal not committed within {:?}",
                wait
            ))),
        }
    }

    /// Snapshot of the locally applied state machine and the index it reflects.
    pub async fn read_state(&self) -> Result<(LogIndex, Vec<u8>)> {
        self.call(|response| RaftCommand::ReadState { response })
            .await
    }

    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.call(|response| RaftCommand::RequestVote { request, response })
            .await
    }

    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(|response| RaftCommand::AppendEntries { request, response })
            .await
    }

    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(|response| RaftCommand::InstallSnapshot { request, response })
            .await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RaftCommand::Shutdown).await;
    }
}
