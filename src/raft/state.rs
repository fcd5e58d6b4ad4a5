//! Raft role and term bookkeeping.

use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a Raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

impl NodeState {
    pub fn is_leader(&self) -> bool {
        matches!(self, NodeState::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, NodeState::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, NodeState::Candidate)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// State that must survive restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Commit and apply positions.
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

/// Per-follower replication progress, kept by the leader.
#[derive(Debug, Clone)]
pub struct LeaderState {
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            next_index: peers.iter().map(|&p| (p, last_log_index + 1)).collect(),
            match_index: peers.iter().map(|&p| (p, 0)).collect(),
        }
    }

    pub fn update_match(&mut self, peer: NodeId, match_index: LogIndex) {
        let current = self.match_index.entry(peer).or_insert(0);
        *current = (*current).max(match_index);
        self.next_index.insert(peer, match_index + 1);
    }

    pub fn decrement_next(&mut self, peer: NodeId) {
        if let Some(next) = self.next_index.get_mut(&peer) {
            *next = next.saturating_sub(1).max(1);
        }
    }
}

/// Complete Raft state for a node.
#[derive(Debug)]
pub struct RaftState {
    pub node_id: NodeId,
    pub state: NodeState,
    pub leader_id: Option<NodeId>,
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    /// Only set while leader.
    pub leader: Option<LeaderState>,
    pub peers: Vec<NodeId>,
}

impl RaftState {
    pub fn new(node_id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            node_id,
            state: NodeState::Follower,
            leader_id: None,
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            leader: None,
            peers,
        }
    }

    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.voted_for = None;
        }
        self.persistent.current_term = term;
        let was = self.state;
        self.state = NodeState::Follower;
        self.leader_id = leader_id;
        self.leader = None;

        if was != NodeState::Follower {
            tracing::info!(
                node_id = self.node_id,
                term,
                leader = ?leader_id,
                "Became follower"
            );
        }
    }

    pub fn become_candidate(&mut self) {
        self.state = NodeState::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.leader = None;

        tracing::debug!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "Became candidate"
        );
    }

    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.node_id);
        self.leader = Some(LeaderState::new(&self.peers, last_log_index));

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "Became leader"
        );
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Highest index stored on a quorum, never below the current commit index.
    ///
    /// The caller still has to check that the entry belongs to the current term.
    pub fn calculate_commit_index(&self, last_log_index: LogIndex) -> LogIndex {
        let leader = match (&self.leader, self.is_leader()) {
            (Some(l), true) => l,
            _ => return self.volatile.commit_index,
        };

        let mut indices: Vec<LogIndex> = leader.match_index.values().copied().collect();
        indices.push(last_log_index);
        indices.sort_unstable_by(|a, b| b.cmp(a));

        indices
            .get(self.quorum_size() - 1)
            .copied()
            .unwrap_or(0)
            .max(self.volatile.commit_index)
    }
}
