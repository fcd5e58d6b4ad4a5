//! Leader-gated metadata RPCs.
//!
//! The service owns a working copy of [`MetadataState`]. Every mutation runs
//! under one service-wide async mutex: check leadership, edit the working copy,
//! propose the whole image through Raft and wait for it to apply. Read-only
//! calls answer from whatever copy this replica holds, which on followers is
//! refreshed periodically (see `migration.rs`).

use super::operations::*;
use super::namespace::FileEntry;
use super::state::{BlockAddrs, MetadataState};
use crate::client::chunk::ChunkRpc;
use crate::cluster::placement::{Candidate, PlacementEngine};
use crate::config::MetadataConfig;
use crate::error::{BlockFsError, Result};
use crate::observability;
use crate::raft::RaftHandle;
use crate::types::{block_count, is_dir, FetchOp, Loc, NodeId, Term};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// A chunk server whose registration has not committed yet.
///
/// Its prospective loc already takes part in placement and migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct PendingRegistration {
    pub addr: String,
    pub loc: Loc,
}

pub(super) struct ServiceState {
    pub state: MetadataState,
    pub pending: Option<PendingRegistration>,
    /// Term whose committed image the working copy was last synced with.
    pub adopted_term: Option<Term>,
}

impl ServiceState {
    /// Every registered loc plus the pending one.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .state
            .replicas
            .servers()
            .map(|(loc, info)| Candidate {
                loc,
                block_count: info.block_count,
            })
            .collect();
        if let Some(pending) = &self.pending {
            candidates.push(Candidate {
                loc: pending.loc,
                block_count: 0,
            });
        }
        candidates
    }

    pub fn address_of(&self, loc: Loc) -> Option<String> {
        match &self.pending {
            Some(pending) if pending.loc == loc => Some(pending.addr.clone()),
            _ => self.state.replicas.addr_of(loc).map(str::to_string),
        }
    }
}

pub struct MetadataService {
    node_id: NodeId,
    pub(super) raft: RaftHandle,
    pub(super) chunks: Arc<dyn ChunkRpc>,
    pub(super) placement: PlacementEngine,
    block_size: u64,
    replica_factor: usize,
    max_file_blocks: usize,
    propose_timeout: Duration,
    pub(super) inner: Mutex<ServiceState>,
}

impl MetadataService {
    pub fn new(
        node_id: NodeId,
        config: &MetadataConfig,
        raft: RaftHandle,
        chunks: Arc<dyn ChunkRpc>,
    ) -> Self {
        Self::with_placement(
            node_id,
            config,
            raft,
            chunks,
            PlacementEngine::new(config.placement),
        )
    }

    /// Use a specific placement engine, e.g. a seeded one.
    pub fn with_placement(
        node_id: NodeId,
        config: &MetadataConfig,
        raft: RaftHandle,
        chunks: Arc<dyn ChunkRpc>,
        placement: PlacementEngine,
    ) -> Self {
        Self {
            node_id,
            raft,
            chunks,
            placement,
            block_size: config.block_size,
            replica_factor: config.replica_factor,
            max_file_blocks: config.max_file_blocks,
            propose_timeout: config.propose_timeout,
            inner: Mutex::new(ServiceState {
                state: MetadataState::new(),
                pending: None,
                adopted_term: None,
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Copy of this replica's current view.
    pub async fn state(&self) -> MetadataState {
        self.inner.lock().await.state.clone()
    }

    /// Take the service mutex, failing unless this replica leads.
    ///
    /// The first mutation of a new term adopts the committed image first.
    pub(super) async fn lock_leader(&self) -> Result<MutexGuard<'_, ServiceState>> {
        let mut inner = self.inner.lock().await;
        let status = self.raft.status().await?;
        if !status.is_leader {
            return Err(BlockFsError::NotLeader {
                leader: status.leader_id,
            });
        }
        if inner.adopted_term != Some(status.term) {
            self.adopt_committed_state(&mut inner, status.term).await?;
        }
        Ok(inner)
    }

    async fn adopt_committed_state(&self, inner: &mut ServiceState, term: Term) -> Result<()> {
        // An empty entry applies only after everything committed before it.
        self.raft.propose(Vec::new(), self.propose_timeout).await?;
        let (index, data) = self.raft.read_state().await?;
        inner.state = MetadataState::decode(&data)?;
        inner.adopted_term = Some(term);
        info!(
            node_id = self.node_id,
            term,
            index,
            "Adopted committed metadata state"
        );
        Ok(())
    }

    /// Propose the working copy and wait until it applies.
    pub(super) async fn commit(&self, inner: &mut ServiceState) -> Result<()> {
        let data = inner.state.encode()?;
        let size = data.len();
        match self.raft.propose(data, self.propose_timeout).await {
            Ok(index) => {
                debug!(node_id = self.node_id, index, size, "Committed metadata state");
                observability::update_metadata_gauges(
                    inner.state.replicas.server_count(),
                    inner.state.namespace.len(),
                    inner.state.replicas.block_count(),
                );
                Ok(())
            }
            Err(e) => {
                // The working copy may now be ahead of the log.
                inner.adopted_term = None;
                warn!(node_id = self.node_id, error = %e, "Proposal failed");
                Err(e)
            }
        }
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let mut inner = self.lock_leader().await?;
        let addr = request.addr;
        let loc = inner.state.replicas.next_loc();
        info!(addr = %addr, loc, "Registering chunk server");

        inner.pending = Some(PendingRegistration {
            addr: addr.clone(),
            loc,
        });
        let outdated = inner.state.replicas.loc_of(&addr);
        let removal = match outdated {
            Some(old_loc) => self.remove_chunk_server(&mut inner, old_loc).await,
            None => Default::default(),
        };
        inner.pending = None;

        if let Some(e) = removal.failure {
            warn!(addr = %addr, loc, error = %e, "Registration failed");
            if removal.moved > 0 {
                self.commit(&mut inner).await?;
            }
            observability::record_metadata_op("register", false);
            return Err(e);
        }

        inner.state.replicas.register(addr.clone());
        self.commit(&mut inner).await?;
        observability::record_metadata_op("register", true);
        info!(addr = %addr, loc, "Registered chunk server");

        Ok(RegisterResponse {
            block_size: self.block_size,
            loc,
        })
    }

    pub async fn create(&self, request: CreateRequest) -> Result<CreateResponse> {
        let mut inner = self.lock_leader().await?;
        let CreateRequest { path, size } = request;
        inner.state.namespace.check_create(&path)?;

        let (blocks, size) = if is_dir(&path) {
            (0, 0)
        } else {
            match block_count(size, self.block_size) {
                Some(blocks) if blocks <= self.max_file_blocks => (blocks, size),
                _ => {
                    observability::record_metadata_op("create", false);
                    return Err(BlockFsError::InvalidOperation(format!(
                        "{} bytes exceeds the limit of {} blocks",
                        size, self.max_file_blocks
                    )));
                }
            }
        };

        // Place every block before touching state so a failure leaves nothing behind.
        let mut candidates = inner.candidates();
        let mut placed = Vec::new();
        for index in 0..blocks {
            let locs = self.placement.choose(&candidates, self.replica_factor)?;
            for candidate in candidates.iter_mut().filter(|c| locs.contains(&c.loc)) {
                candidate.block_count += 1;
            }
            let block_id = self.placement.new_block_id();
            debug!(path = %path, index, block_id = %block_id, ?locs, "Placed block");
            placed.push((block_id, locs));
        }

        for (block_id, locs) in &placed {
            inner.state.replicas.insert_block(*block_id, locs);
        }
        inner.state.namespace.insert(
            path.clone(),
            FileEntry {
                blocks: placed.into_iter().map(|(id, _)| id).collect(),
                size,
            },
        );
        self.commit(&mut inner).await?;
        observability::record_metadata_op("create", true);
        info!(path = %path, size, blocks, "Created path");

        Ok(CreateResponse {
            block_size: self.block_size,
        })
    }

    pub async fn open(&self, request: OpenRequest) -> Result<OpenResponse> {
        let inner = self.inner.lock().await;
        let entry = inner.state.namespace.open(&request.path)?;
        Ok(OpenResponse {
            block_size: self.block_size,
            block_count: entry.blocks.len() as u64,
        })
    }

    /// Resolve one block. The REMOVE fetch of a file's last block also deletes the file.
    pub async fn fetch_block_addrs(
        &self,
        request: FetchBlockAddrsRequest,
    ) -> Result<FetchBlockAddrsResponse> {
        let FetchBlockAddrsRequest { path, index, op } = request;

        if op != FetchOp::Remove {
            let inner = self.inner.lock().await;
            let found = inner.state.block_addrs(&path, index, op)?;
            debug!(path = %path, index, %op, addrs = ?found.addrs, "Fetched block addresses");
            return Ok(found.into());
        }

        let mut inner = self.lock_leader().await?;
        let found = inner.state.block_addrs(&path, index, op)?;
        if found.tombstones {
            inner.state.tombstone(&path);
            self.commit(&mut inner).await?;
            observability::record_metadata_op("remove", true);
            info!(path = %path, "Removed path");
        }
        Ok(found.into())
    }

    pub async fn locs_validity_notify(&self, request: LocsValidityNotifyRequest) -> Result<Ack> {
        let mut inner = self.lock_leader().await?;
        let block_id = request.block_id;
        if inner.state.replicas.replicas(&block_id).is_none() {
            // Already collected, e.g. by the tombstone of an unwritten file.
            debug!(block_id = %block_id, "Ignoring validity for unknown block");
            return Ok(Ack::default());
        }

        for (addr, valid) in &request.validity {
            let Some(loc) = inner.state.replicas.loc_of(addr) else {
                warn!(addr = %addr, block_id = %block_id, "Ignoring validity for unknown chunk server");
                continue;
            };
            if !inner.state.replicas.set_validity(&block_id, loc, *valid) {
                warn!(addr = %addr, loc, block_id = %block_id, "Chunk server holds no replica of block");
            }
        }
        if inner.state.collect_block(&block_id) {
            debug!(block_id = %block_id, "Collected unreferenced block");
        }

        self.commit(&mut inner).await?;
        observability::record_metadata_op("locs_validity_notify", true);
        debug!(block_id = %block_id, validity = ?request.validity, "Updated replica validity");
        Ok(Ack::default())
    }

    pub async fn rename(&self, request: RenameRequest) -> Result<Ack> {
        let mut inner = self.lock_leader().await?;
        inner
            .state
            .namespace
            .rename(&request.old_path, &request.new_path)?;
        self.commit(&mut inner).await?;
        observability::record_metadata_op("rename", true);
        info!(from = %request.old_path, to = %request.new_path, "Renamed path");
        Ok(Ack::default())
    }

    pub async fn fetch_file_info(
        &self,
        request: FetchFileInfoRequest,
    ) -> Result<FetchFileInfoResponse> {
        let inner = self.inner.lock().await;
        let infos = inner.state.namespace.file_info(&request.path)?;
        Ok(FetchFileInfoResponse { infos })
    }

    pub async fn is_leader(&self) -> Result<IsLeaderResponse> {
        let status = self.raft.status().await?;
        Ok(IsLeaderResponse {
            is_leader: status.is_leader,
            leader: status.leader_id,
        })
    }
}

impl From<BlockAddrs> for FetchBlockAddrsResponse {
    fn from(found: BlockAddrs) -> Self {
        Self {
            addrs: found.addrs,
            block_id: found.block_id,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::chunk::mock::MemoryChunks;
    use crate::cluster::placement::PlacementStrategy;
    use crate::metadata::MetadataStateMachine;
    use crate::raft::rpc::mock::{LoopbackNetwork, LoopbackRpc};
    use crate::raft::RaftNode;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    pub(crate) struct Harness {
        pub service: Arc<MetadataService>,
        pub chunks: Arc<MemoryChunks>,
        pub raft: RaftHandle,
        _dir: TempDir,
    }

    pub(crate) fn test_config() -> MetadataConfig {
        MetadataConfig {
            block_size: 64,
            max_file_blocks: 16,
            ..Default::default()
        }
    }

    /// Single-replica service over in-memory chunk servers.
    pub(crate) async fn harness(servers: &[&str]) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = test_config();
        let network = LoopbackNetwork::new();
        let rpc = Arc::new(LoopbackRpc::new(1, Arc::clone(&network)));
        let (node, rx) = RaftNode::new(
            config.raft_config(1).unwrap(),
            dir.path(),
            MetadataStateMachine::new(),
            rpc,
        )
        .unwrap();
        let raft = node.handle();
        network.register(1, raft.clone());
        tokio::spawn(node.run(rx));
        while !raft.is_leader().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let chunks = Arc::new(MemoryChunks::default());
        let service = Arc::new(MetadataService::with_placement(
            1,
            &config,
            raft.clone(),
            chunks.clone(),
            PlacementEngine::with_seed(PlacementStrategy::Random, 7),
        ));
        for addr in servers {
            chunks.add_server(addr);
            service
                .register(RegisterRequest {
                    addr: addr.to_string(),
                })
                .await
                .unwrap();
        }

        Harness {
            service,
            chunks,
            raft,
            _dir: dir,
        }
    }

    /// Create `path` and write every block to all of its replicas.
    pub(crate) async fn put(h: &Harness, path: &str, data: &[u8]) {
        h.service
            .create(CreateRequest {
                path: path.into(),
                size: data.len() as u64,
            })
            .await
            .unwrap();
        for (index, chunk) in data.chunks(64).enumerate() {
            let found = h
                .service
                .fetch_block_addrs(FetchBlockAddrsRequest {
                    path: path.into(),
                    index: index as u64,
                    op: FetchOp::Put,
                })
                .await
                .unwrap();
            let block_id = found.block_id.unwrap();
            let mut validity = BTreeMap::new();
            for addr in found.addrs {
                let ok = h.chunks.write(&addr, block_id, chunk.to_vec()).await.is_ok();
                validity.insert(addr, ok);
            }
            h.service
                .locs_validity_notify(LocsValidityNotifyRequest { block_id, validity })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_register_assigns_increasing_locs() {
        let h = harness(&["a:1", "b:1"]).await;
        let state = h.service.state().await;
        assert_eq!(state.replicas.loc_of("a:1"), Some(0));
        assert_eq!(state.replicas.loc_of("b:1"), Some(1));

        // Re-registering drops the old loc and hands out a fresh one.
        let response = h
            .service
            .register(RegisterRequest {
                addr: "a:1".into(),
            })
            .await
            .unwrap();
        assert_eq!(response.loc, 2);
        assert_eq!(response.block_size, 64);
        let state = h.service.state().await;
        assert_eq!(state.replicas.loc_of("a:1"), Some(2));
        assert!(state.replicas.addr_of(0).is_none());
    }

    #[tokio::test]
    async fn test_create_places_replicas() {
        let h = harness(&["a:1", "b:1", "c:1", "d:1"]).await;
        h.service
            .create(CreateRequest {
                path: "/f".into(),
                size: 200,
            })
            .await
            .unwrap();

        let state = h.service.state().await;
        let entry = state.namespace.get("/f").unwrap();
        assert_eq!(entry.blocks.len(), 4);
        for block in &entry.blocks {
            let set = state.replicas.replicas(block).unwrap();
            assert_eq!(set.len(), 3);
            assert!(set.values().all(|valid| !valid));
        }

        let open = h
            .service
            .open(OpenRequest { path: "/f".into() })
            .await
            .unwrap();
        assert_eq!(open.block_count, 4);
    }

    #[tokio::test]
    async fn test_create_errors_leave_state_untouched() {
        let h = harness(&["a:1", "b:1"]).await;
        let before = h.service.state().await;

        let err = h
            .service
            .create(CreateRequest {
                path: "/f".into(),
                size: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BlockFsError::InsufficientReplicas { need: 3, have: 2 }));

        let err = h
            .service
            .create(CreateRequest {
                path: "/missing/f".into(),
                size: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BlockFsError::NotFound(_)));
        assert_eq!(h.service.state().await, before);

        // Directories and empty files need no chunk servers.
        h.service
            .create(CreateRequest {
                path: "/doc/".into(),
                size: 0,
            })
            .await
            .unwrap();
        let err = h
            .service
            .create(CreateRequest {
                path: "/doc/".into(),
                size: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BlockFsError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_validity_notify_flips_flags() {
        let h = harness(&["a:1", "b:1", "c:1"]).await;
        put(&h, "/f", &[7u8; 100]).await;

        let found = h
            .service
            .fetch_block_addrs(FetchBlockAddrsRequest {
                path: "/f".into(),
                index: 1,
                op: FetchOp::Get,
            })
            .await
            .unwrap();
        assert_eq!(found.addrs.len(), 3);

        let put_addrs = h
            .service
            .fetch_block_addrs(FetchBlockAddrsRequest {
                path: "/f".into(),
                index: 1,
                op: FetchOp::Put,
            })
            .await
            .unwrap();
        assert!(put_addrs.addrs.is_empty());

        // Unknown addresses are ignored.
        let mut validity = BTreeMap::new();
        validity.insert("zz:9".to_string(), true);
        validity.insert("a:1".to_string(), false);
        h.service
            .locs_validity_notify(LocsValidityNotifyRequest {
                block_id: found.block_id.unwrap(),
                validity,
            })
            .await
            .unwrap();
        let state = h.service.state().await;
        let set = state.replicas.replicas(&found.block_id.unwrap()).unwrap();
        assert_eq!(set.values().filter(|v| **v).count(), 2);
    }

    #[tokio::test]
    async fn test_remove_tombstones_on_last_block() {
        let h = harness(&["a:1", "b:1", "c:1"]).await;
        put(&h, "/f", &[1u8; 130]).await;

        for index in 0..3u64 {
            let found = h
                .service
                .fetch_block_addrs(FetchBlockAddrsRequest {
                    path: "/f".into(),
                    index,
                    op: FetchOp::Remove,
                })
                .await
                .unwrap();
            assert_eq!(found.addrs.len(), 3);
            let still_there = h.service.state().await.namespace.contains("/f");
            assert_eq!(still_there, index < 2);

            let validity = found.addrs.into_iter().map(|a| (a, false)).collect();
            h.service
                .locs_validity_notify(LocsValidityNotifyRequest {
                    block_id: found.block_id.unwrap(),
                    validity,
                })
                .await
                .unwrap();
        }

        let state = h.service.state().await;
        assert_eq!(state.replicas.block_count(), 0);
        let err = h
            .service
            .fetch_block_addrs(FetchBlockAddrsRequest {
                path: "/f".into(),
                index: 0,
                op: FetchOp::Remove,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BlockFsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_empty_file() {
        let h = harness(&[]).await;
        h.service
            .create(CreateRequest {
                path: "/empty".into(),
                size: 0,
            })
            .await
            .unwrap();
        let found = h
            .service
            .fetch_block_addrs(FetchBlockAddrsRequest {
                path: "/empty".into(),
                index: 0,
                op: FetchOp::Remove,
            })
            .await
            .unwrap();
        assert!(found.block_id.is_none());
        assert!(!h.service.state().await.namespace.contains("/empty"));
    }

    #[tokio::test]
    async fn test_remove_unwritten_file() {
        let h = harness(&["a:1", "b:1", "c:1"]).await;
        h.service
            .create(CreateRequest {
                path: "/f".into(),
                size: 100,
            })
            .await
            .unwrap();

        for index in 0..2u64 {
            let found = h
                .service
                .fetch_block_addrs(FetchBlockAddrsRequest {
                    path: "/f".into(),
                    index,
                    op: FetchOp::Remove,
                })
                .await
                .unwrap();
            // Nothing was written, so every slot is still invalid.
            assert!(found.addrs.is_empty());
            h.service
                .locs_validity_notify(LocsValidityNotifyRequest {
                    block_id: found.block_id.unwrap(),
                    validity: BTreeMap::new(),
                })
                .await
                .unwrap();
        }

        let state = h.service.state().await;
        assert!(!state.namespace.contains("/f"));
        assert_eq!(state.replicas.block_count(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_oversized_file() {
        let h = harness(&["a:1", "b:1", "c:1"]).await;
        let before = h.service.state().await;

        for size in [u64::MAX, 64 * 16 + 1] {
            let err = h
                .service
                .create(CreateRequest {
                    path: "/huge".into(),
                    size,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, BlockFsError::InvalidOperation(_)));
        }
        assert_eq!(h.service.state().await, before);

        // Exactly at the limit is fine.
        h.service
            .create(CreateRequest {
                path: "/huge".into(),
                size: 64 * 1024,
            })
            .await
            .unwrap();
        assert_eq!(
            h.service.state().await.namespace.get("/huge").unwrap().blocks.len(),
            16
        );
    }

    #[tokio::test]
    async fn test_rename_and_file_info() {
        let h = harness(&[]).await;
        for path in ["/doc/", "/doc/a"] {
            h.service
                .create(CreateRequest {
                    path: path.into(),
                    size: 0,
                })
                .await
                .unwrap();
        }
        h.service
            .rename(RenameRequest {
                old_path: "/doc/a".into(),
                new_path: "/doc/b".into(),
            })
            .await
            .unwrap();
        let err = h
            .service
            .rename(RenameRequest {
                old_path: "/doc/".into(),
                new_path: "/docs/".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BlockFsError::InvalidOperation(_)));

        let infos = h
            .service
            .fetch_file_info(FetchFileInfoRequest {
                path: "/doc/".into(),
            })
            .await
            .unwrap()
            .infos;
        let names: Vec<_> = infos.into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["/doc/", "/doc/b"]);
    }

    #[tokio::test]
    async fn test_committed_state_matches_working_copy() {
        let h = harness(&["a:1", "b:1", "c:1"]).await;
        put(&h, "/f", b"hello").await;

        let (_, data) = h.raft.read_state().await.unwrap();
        let committed = MetadataState::decode(&data).unwrap();
        assert_eq!(committed, h.service.state().await);
    }
}
