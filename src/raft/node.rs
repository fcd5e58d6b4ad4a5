//! Raft node event loop.

use super::handle::{RaftHandle, RaftStatus};
use super::rpc::*;
use super::state::*;
use super::storage::SnapshotMeta;
use super::{LogEntry, RaftLog, RaftStorage, StateMachine};
use crate::error::{BlockFsError, Result};
use crate::observability;
use crate::types::{LogIndex, NodeId, Term};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Raft configuration.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// Peer node IDs and addresses, excluding this node.
    pub peers: HashMap<NodeId, String>,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Bound on each vote or append round trip.
    pub rpc_timeout: Duration,
    /// Entries are whole metadata images, so batches stay small.
    pub max_entries_per_append: usize,
    /// Applied entries between snapshots.
    pub snapshot_threshold: u64,
    pub snapshot_chunk_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: HashMap::new(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(200),
            max_entries_per_append: 16,
            snapshot_threshold: 64,
            snapshot_chunk_size: 1024 * 1024,
        }
    }
}

/// Command for the Raft node.
pub enum RaftCommand {
    /// Replicate a command; answered once it is applied or superseded.
    Propose {
        data: Vec<u8>,
        response: oneshot::Sender<Result<LogIndex>>,
    },
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },
    /// Serialized state machine with the index it reflects.
    ReadState {
        response: oneshot::Sender<(LogIndex, Vec<u8>)>,
    },
    Status {
        response: oneshot::Sender<RaftStatus>,
    },
    Shutdown,
}

/// Snapshot being received in chunks.
#[derive(Debug)]
struct PendingSnapshot {
    data: Vec<u8>,
    last_included_index: LogIndex,
    last_included_term: Term,
    next_offset: u64,
}

/// Caller waiting for its proposal to be applied.
struct Waiter {
    term: Term,
    response: oneshot::Sender<Result<LogIndex>>,
}

/// The Raft node, managing consensus for a replicated state machine.
pub struct RaftNode<S: StateMachine> {
    config: RaftConfig,
    state: RwLock<RaftState>,
    log: RwLock<RaftLog>,
    storage: RaftStorage,
    state_machine: RwLock<S>,
    rpc: Arc<dyn RaftRpc>,
    command_tx: mpsc::Sender<RaftCommand>,
    pending_snapshot: Mutex<Option<PendingSnapshot>>,
    waiters: Mutex<BTreeMap<LogIndex, Waiter>>,
}

impl<S: StateMachine + 'static> RaftNode<S> {
    /// Open storage, restore the last snapshot and reload the log.
    pub fn new<P: AsRef<Path>>(
        config: RaftConfig,
        storage_path: P,
        mut state_machine: S,
        rpc: Arc<dyn RaftRpc>,
    ) -> Result<(Self, mpsc::Receiver<RaftCommand>)> {
        let storage = RaftStorage::open(storage_path)?;

        let peers: Vec<NodeId> = config.peers.keys().copied().collect();
        let mut raft_state = RaftState::new(config.node_id, peers);
        if let Some(persistent) = storage.load_persistent_state()? {
            raft_state.persistent = persistent;
        }

        let mut log = RaftLog::new();
        if let Some((snapshot, meta)) = storage.load_snapshot()? {
            state_machine.restore(&snapshot)?;
            log.compact(meta.last_index, meta.last_term);
            raft_state.volatile.commit_index = meta.last_index;
            raft_state.volatile.last_applied = meta.last_index;
            info!(
                node_id = config.node_id,
                last_index = meta.last_index,
                "Restored snapshot"
            );
        }

        for entry in storage.load_log_entries_from(log.first_index())? {
            log.append(entry)?;
        }

        let (command_tx, command_rx) = mpsc::channel(1000);

        let node = Self {
            config,
            state: RwLock::new(raft_state),
            log: RwLock::new(log),
            storage,
            state_machine: RwLock::new(state_machine),
            rpc,
            command_tx,
            pending_snapshot: Mutex::new(None),
            waiters: Mutex::new(BTreeMap::new()),
        };

        Ok((node, command_rx))
    }

    pub fn handle(&self) -> RaftHandle {
        RaftHandle::new(self.command_tx.clone())
    }

    /// Run the Raft node event loop until shutdown.
    pub async fn run(self, mut command_rx: mpsc::Receiver<RaftCommand>) {
        let mut election_deadline = self.next_election_deadline();
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let is_leader = self.state.read().is_leader();

            tokio::select! {
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        RaftCommand::Shutdown => {
                            info!(node_id = self.config.node_id, "Raft node shutting down");
                            break;
                        }
                        RaftCommand::Propose { data, response } => {
                            self.handle_propose(data, response).await;
                        }
                        RaftCommand::RequestVote { request, response } => {
                            let result = self.handle_request_vote(request);
                            if result.vote_granted {
                                election_deadline = self.next_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        RaftCommand::AppendEntries { request, response } => {
                            let (result, from_leader) = self.handle_append_entries(request);
                            if from_leader {
                                election_deadline = self.next_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        RaftCommand::InstallSnapshot { request, response } => {
                            let term = request.term;
                            let result = self.handle_install_snapshot(request);
                            if result.term == term {
                                election_deadline = self.next_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        RaftCommand::ReadState { response } => {
                            let _ = response.send(self.read_state());
                        }
                        RaftCommand::Status { response } => {
                            let _ = response.send(self.status());
                        }
                    }
                }

                _ = heartbeat.tick(), if is_leader => {
                    self.replicate_to_all().await;
                }

                _ = tokio::time::sleep_until(election_deadline), if !is_leader => {
                    self.start_election().await;
                    election_deadline = self.next_election_deadline();
                }
            }

            // A deposed leader's old deadline is long past.
            if is_leader && !self.state.read().is_leader() {
                election_deadline = self.next_election_deadline();
            }

            self.apply_committed_entries();
            self.maybe_snapshot();

            let status = self.status();
            observability::update_raft_metrics(status.term, status.commit_index);
        }

        let mut waiters = self.waiters.lock();
        for (_, waiter) in std::mem::take(&mut *waiters) {
            let _ = waiter
                .response
                .send(Err(BlockFsError::Internal("raft node stopped".into())));
        }
    }

    fn status(&self) -> RaftStatus {
        let state = self.state.read();
        RaftStatus {
            node_id: state.node_id,
            is_leader: state.is_leader(),
            leader_id: state.leader_id,
            term: state.current_term(),
            commit_index: state.volatile.commit_index,
            last_applied: state.volatile.last_applied,
        }
    }

    fn read_state(&self) -> (LogIndex, Vec<u8>) {
        let last_applied = self.state.read().volatile.last_applied;
        (last_applied, self.state_machine.read().snapshot())
    }

    async fn handle_propose(&self, data: Vec<u8>, response: oneshot::Sender<Result<LogIndex>>) {
        let (term, is_leader, leader) = {
            let state = self.state.read();
            (state.current_term(), state.is_leader(), state.leader_id)
        };

        if !is_leader {
            let _ = response.send(Err(BlockFsError::NotLeader { leader }));
            return;
        }

        match self.append_local(term, data) {
            Ok(index) => {
                self.waiters.lock().insert(index, Waiter { term, response });
                self.replicate_to_all().await;
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    /// Append to the leader's own log and persist it.
    fn append_local(&self, term: Term, data: Vec<u8>) -> Result<LogIndex> {
        let mut log = self.log.write();
        let index = log.last_index() + 1;
        let entry = LogEntry::new(term, index, data);
        self.storage
            .append_log_entries(std::slice::from_ref(&entry))?;
        log.append(entry)?;
        Ok(index)
    }

    fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.write();
        let log = self.log.read();

        if request.term > state.current_term() {
            state.become_follower(request.term, None);
            self.persist_state(&state);
        }

        let vote_granted = if request.term < state.current_term() {
            false
        } else if state
            .persistent
            .voted_for
            .is_some_and(|v| v != request.candidate_id)
        {
            false
        } else if !log.is_up_to_date(request.last_log_index, request.last_log_term) {
            false
        } else {
            state.persistent.voted_for = Some(request.candidate_id);
            self.persist_state(&state);
            true
        };

        debug!(
            node_id = state.node_id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "Handled RequestVote"
        );

        RequestVoteResponse {
            term: state.current_term(),
            vote_granted,
        }
    }

    /// Returns the response and whether the sender is a current leader.
    fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> (AppendEntriesResponse, bool) {
        let mut state = self.state.write();
        let mut log = self.log.write();

        let reject = |term: Term, conflict_index: Option<LogIndex>| AppendEntriesResponse {
            term,
            success: false,
            match_index: 0,
            conflict_index,
        };

        if request.term < state.current_term() {
            return (reject(state.current_term(), None), false);
        }

        if request.term > state.current_term() || !state.state.is_follower() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }
        state.leader_id = Some(request.leader_id);
        let term = state.current_term();

        let snapshot_index = log.snapshot_index();
        if request.prev_log_index >= snapshot_index
            && !log.matches(request.prev_log_index, request.prev_log_term)
        {
            let conflict_index = match log.term_at(request.prev_log_index) {
                Some(conflict_term) => {
                    let mut idx = request.prev_log_index;
                    while idx > log.first_index() && log.term_at(idx - 1) == Some(conflict_term)
                    {
                        idx -= 1;
                    }
                    idx
                }
                None => log.last_index() + 1,
            };
            return (reject(term, Some(conflict_index)), true);
        }

        let last_new_index = request.prev_log_index + request.entries.len() as u64;
        let mut new_entries = Vec::new();
        for entry in request.entries {
            if entry.index <= snapshot_index {
                continue;
            }
            match log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    log.truncate_from(entry.index);
                    if let Err(e) = self.storage.truncate_log_from(entry.index) {
                        error!(error = %e, index = entry.index, "Failed to truncate stored log");
                        return (reject(term, Some(entry.index)), true);
                    }
                    new_entries.push(entry);
                }
                None => new_entries.push(entry),
            }
        }

        if !new_entries.is_empty() {
            if let Err(e) = self.storage.append_log_entries(&new_entries) {
                error!(
                    error = %e,
                    entry_count = new_entries.len(),
                    "Failed to persist log entries"
                );
                return (reject(term, None), true);
            }
            for entry in new_entries {
                let index = entry.index;
                if let Err(e) = log.append(entry) {
                    error!(error = %e, index, "Failed to append entry to in-memory log");
                    return (reject(term, Some(log.last_index() + 1)), true);
                }
            }
        }

        let matched = last_new_index.max(snapshot_index);
        if request.leader_commit > state.volatile.commit_index {
            state.volatile.commit_index = request.leader_commit.min(matched);
        }

        (
            AppendEntriesResponse {
                term,
                success: true,
                match_index: matched,
                conflict_index: None,
            },
            true,
        )
    }

    async fn start_election(&self) {
        let (term, last_log_index, last_log_term, quorum_size) = {
            let mut state = self.state.write();
            let log = self.log.read();
            state.become_candidate();
            self.persist_state(&state);
            (
                state.current_term(),
                log.last_index(),
                log.last_term(),
                state.quorum_size(),
            )
        };

        debug!(node_id = self.config.node_id, term, "Starting election");

        let request = RequestVoteRequest {
            term,
            candidate_id: self.config.node_id,
            last_log_index,
            last_log_term,
        };

        let mut votes = 1;

        if votes < quorum_size {
            let vote_futures = self.config.peers.keys().map(|&peer_id| {
                let rpc = Arc::clone(&self.rpc);
                let req = request.clone();
                let wait = self.config.rpc_timeout;
                async move {
                    match timeout(wait, rpc.request_vote(peer_id, req)).await {
                        Ok(Ok(response)) => Some((peer_id, response)),
                        _ => None,
                    }
                }
            });
            let results = futures::future::join_all(vote_futures).await;

            let mut state = self.state.write();
            if !state.state.is_candidate() || state.current_term() != term {
                return;
            }
            for (peer_id, response) in results.into_iter().flatten() {
                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    self.persist_state(&state);
                    return;
                }
                if response.vote_granted {
                    votes += 1;
                    debug!(
                        node_id = self.config.node_id,
                        voter = peer_id,
                        votes,
                        "Received vote"
                    );
                }
            }
        }

        if votes < quorum_size {
            return;
        }

        {
            let mut state = self.state.write();
            if !state.state.is_candidate() || state.current_term() != term {
                return;
            }
            let last_index = self.log.read().last_index();
            state.become_leader(last_index);
        }

        // Entries from earlier terms only commit behind one from this term.
        if let Err(e) = self.append_local(term, Vec::new()) {
            error!(error = %e, "Failed to append leader no-op");
        }
        self.replicate_to_all().await;
    }

    /// One AppendEntries round to every follower, then advance the commit index.
    async fn replicate_to_all(&self) {
        let (term, commit_index, next_indices) = {
            let state = self.state.read();
            match (&state.leader, state.is_leader()) {
                (Some(leader), true) => (
                    state.current_term(),
                    state.volatile.commit_index,
                    leader.next_index.clone(),
                ),
                _ => return,
            }
        };

        let mut lagging = Vec::new();
        let mut replication_futures = Vec::new();
        {
            let log = self.log.read();
            for (&peer_id, &next_index) in &next_indices {
                if next_index <= log.snapshot_index() {
                    lagging.push(peer_id);
                    continue;
                }
                let prev_log_index = next_index - 1;
                let request = AppendEntriesRequest {
                    term,
                    leader_id: self.config.node_id,
                    prev_log_index,
                    prev_log_term: log.term_at(prev_log_index).unwrap_or(0),
                    entries: log
                        .entries_from_limit(next_index, self.config.max_entries_per_append),
                    leader_commit: commit_index,
                };
                let rpc = Arc::clone(&self.rpc);
                let wait = self.config.rpc_timeout;
                replication_futures.push(async move {
                    match timeout(wait, rpc.append_entries(peer_id, request)).await {
                        Ok(Ok(response)) => Some((peer_id, response)),
                        Ok(Err(e)) => {
                            debug!(peer = peer_id, error = %e, "AppendEntries failed");
                            None
                        }
                        Err(_) => None,
                    }
                });
            }
        }

        let results = futures::future::join_all(replication_futures).await;

        {
            let mut state = self.state.write();
            if !state.is_leader() || state.current_term() != term {
                return;
            }

            for (peer_id, response) in results.into_iter().flatten() {
                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    self.persist_state(&state);
                    return;
                }
                if let Some(leader) = state.leader.as_mut() {
                    if response.success {
                        leader.update_match(peer_id, response.match_index);
                    } else if let Some(conflict_index) = response.conflict_index {
                        leader.next_index.insert(peer_id, conflict_index.max(1));
                    } else {
                        leader.decrement_next(peer_id);
                    }
                }
            }

            self.advance_commit_index(&mut state);
        }

        for peer_id in lagging {
            if let Err(e) = self.send_snapshot_to_follower(peer_id).await {
                debug!(peer = peer_id, error = %e, "Snapshot transfer failed");
            }
        }
    }

    fn advance_commit_index(&self, state: &mut RaftState) {
        let log = self.log.read();
        let candidate = state.calculate_commit_index(log.last_index());
        if candidate > state.volatile.commit_index
            && log.term_at(candidate) == Some(state.current_term())
        {
            state.volatile.commit_index = candidate;
            debug!(
                node_id = state.node_id,
                commit_index = candidate,
                "Updated commit index"
            );
        }
    }

    fn apply_committed_entries(&self) {
        let (commit_index, last_applied) = {
            let state = self.state.read();
            (state.volatile.commit_index, state.volatile.last_applied)
        };
        if commit_index <= last_applied {
            return;
        }

        let entries = self
            .log
            .read()
            .entries_range(last_applied + 1, commit_index);

        for entry in entries {
            if !entry.is_noop() {
                let mut sm = self.state_machine.write();
                if let Err(e) = sm.apply(entry.index, entry.data_bytes()) {
                    error!(index = entry.index, error = %e, "State machine rejected entry");
                }
            }
            self.state.write().volatile.last_applied = entry.index;
            self.resolve_waiter(entry.index, entry.term);
        }
    }

    /// A waiter succeeds only if the applied entry is the one it proposed.
    fn resolve_waiter(&self, index: LogIndex, applied_term: Term) {
        let waiter = self.waiters.lock().remove(&index);
        if let Some(waiter) = waiter {
            let result = if waiter.term == applied_term {
                Ok(index)
            } else {
                Err(BlockFsError::NotLeader {
                    leader: self.state.read().leader_id,
                })
            };
            let _ = waiter.response.send(result);
        }
    }

    fn maybe_snapshot(&self) {
        let last_applied = self.state.read().volatile.last_applied;
        let snapshot_index = self.log.read().snapshot_index();

        if last_applied.saturating_sub(snapshot_index) < self.config.snapshot_threshold {
            return;
        }

        let data = self.state_machine.read().snapshot();
        let meta = SnapshotMeta {
            last_index: last_applied,
            last_term: self.log.read().term_at(last_applied).unwrap_or(0),
        };

        if let Err(e) = self.storage.save_snapshot(&data, meta) {
            error!(error = %e, "Failed to save snapshot");
            return;
        }

        self.log.write().compact(meta.last_index, meta.last_term);

        if let Err(e) = self.storage.compact_log(meta.last_index) {
            error!(error = %e, "Failed to compact log");
        }

        info!(
            node_id = self.config.node_id,
            last_applied,
            size = data.len(),
            "Created snapshot"
        );
    }

    fn persist_state(&self, state: &RaftState) {
        if let Err(e) = self.storage.save_persistent_state(&state.persistent) {
            error!(error = %e, "Failed to persist state");
        }
    }

    fn next_election_deadline(&self) -> Instant {
        let timeout = rand::thread_rng()
            .gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Instant::now() + timeout
    }

    fn handle_install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut state = self.state.write();

        if request.term < state.current_term() {
            return InstallSnapshotResponse {
                term: state.current_term(),
                next_offset: 0,
                done: false,
            };
        }
        if request.term > state.current_term() || !state.state.is_follower() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }
        state.leader_id = Some(request.leader_id);
        let term = state.current_term();
        let rejected = InstallSnapshotResponse {
            term,
            next_offset: 0,
            done: false,
        };

        let mut pending = self.pending_snapshot.lock();
        if request.offset == 0 {
            *pending = Some(PendingSnapshot {
                data: Vec::new(),
                last_included_index: request.last_included_index,
                last_included_term: request.last_included_term,
                next_offset: 0,
            });
        }

        let snapshot = match pending.as_mut() {
            Some(s) if s.next_offset == request.offset => s,
            Some(s) => {
                warn!(
                    expected = s.next_offset,
                    received = request.offset,
                    "Snapshot chunk offset mismatch"
                );
                return InstallSnapshotResponse {
                    term,
                    next_offset: s.next_offset,
                    done: false,
                };
            }
            None => return rejected,
        };

        snapshot.data.extend_from_slice(&request.data);
        snapshot.next_offset += request.data.len() as u64;
        let next_offset = snapshot.next_offset;

        if !request.done {
            return InstallSnapshotResponse {
                term,
                next_offset,
                done: false,
            };
        }

        let Some(snapshot) = pending.take() else {
            return rejected;
        };
        drop(pending);

        let meta = SnapshotMeta {
            last_index: snapshot.last_included_index,
            last_term: snapshot.last_included_term,
        };

        if meta.last_index <= state.volatile.last_applied {
            debug!(index = meta.last_index, "Snapshot already covered by applied log");
            return InstallSnapshotResponse {
                term,
                next_offset,
                done: true,
            };
        }

        info!(
            index = meta.last_index,
            term = meta.last_term,
            size = snapshot.data.len(),
            "Installing snapshot"
        );

        if let Err(e) = self.storage.save_snapshot(&snapshot.data, meta) {
            error!(error = %e, "Failed to save snapshot");
            return rejected;
        }
        if let Err(e) = self.state_machine.write().restore(&snapshot.data) {
            error!(error = %e, "Failed to restore state machine from snapshot");
            return rejected;
        }

        {
            let mut log = self.log.write();
            if log.term_at(meta.last_index) != Some(meta.last_term) {
                let first = log.first_index();
                log.truncate_from(first);
                if let Err(e) = self.storage.truncate_log_from(meta.last_index + 1) {
                    error!(error = %e, "Failed to discard conflicting log suffix");
                }
            }
            log.compact(meta.last_index, meta.last_term);
        }
        if let Err(e) = self.storage.compact_log(meta.last_index) {
            error!(error = %e, "Failed to compact log");
        }

        state.volatile.commit_index = state.volatile.commit_index.max(meta.last_index);
        state.volatile.last_applied = meta.last_index;
        drop(state);

        let superseded: Vec<Waiter> = {
            let mut waiters = self.waiters.lock();
            let keep = waiters.split_off(&(meta.last_index + 1));
            std::mem::replace(&mut *waiters, keep).into_values().collect()
        };
        for waiter in superseded {
            let _ = waiter.response.send(Err(BlockFsError::NotLeader {
                leader: Some(request.leader_id),
            }));
        }

        InstallSnapshotResponse {
            term,
            next_offset,
            done: true,
        }
    }

    /// Stream the stored snapshot to a follower whose next entry was compacted away.
    async fn send_snapshot_to_follower(&self, follower_id: NodeId) -> Result<()> {
        let (data, meta) = self
            .storage
            .load_snapshot()?
            .ok_or_else(|| BlockFsError::Internal("no snapshot available".into()))?;

        let term = self.state.read().current_term();
        let chunk_size = self.config.snapshot_chunk_size.max(1);
        let mut offset = 0usize;

        debug!(
            node_id = self.config.node_id,
            follower = follower_id,
            size = data.len(),
            "Sending snapshot"
        );

        loop {
            let end = (offset + chunk_size).min(data.len());
            let last_chunk = end >= data.len();
            let request = InstallSnapshotRequest {
                term,
                leader_id: self.config.node_id,
                last_included_index: meta.last_index,
                last_included_term: meta.last_term,
                offset: offset as u64,
                data: data[offset..end].to_vec(),
                done: last_chunk,
            };

            let response = timeout(
                self.config.rpc_timeout * 10,
                self.rpc.install_snapshot(follower_id, request),
            )
            .await
            .map_err(|_| BlockFsError::Timeout("snapshot chunk".into()))??;

            if response.term > term {
                let mut state = self.state.write();
                state.become_follower(response.term, None);
                self.persist_state(&state);
                return Err(BlockFsError::NotLeader { leader: None });
            }

            if response.done {
                let mut state = self.state.write();
                if let Some(leader) = state.leader.as_mut() {
                    leader.update_match(follower_id, meta.last_index);
                }
                info!(
                    follower = follower_id,
                    index = meta.last_index,
                    "Snapshot delivered"
                );
                return Ok(());
            }

            let next = response.next_offset as usize;
            if last_chunk || next >= data.len() {
                return Err(BlockFsError::Internal(
                    "follower did not accept snapshot".into(),
                ));
            }
            offset = next;
        }
    }
}
