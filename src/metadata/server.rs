//! HTTP surface of a metadata replica: Raft transport plus the metadata API.

use super::operations::*;
use super::service::MetadataService;
use super::MetadataStateMachine;
use crate::client::chunk::{ChunkClient, ChunkRpc};
use crate::client::http;
use crate::config::MetadataConfig;
use crate::error::{BlockFsError, Result};
use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftHandle, RaftNode, RaftRpc, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::shutdown::ShutdownCoordinator;
use crate::types::NodeId;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Default connect timeout for Raft RPC operations.
const RAFT_RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default request timeout for Raft RPC operations.
const RAFT_RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Network-based RPC implementation.
pub struct NetworkRpc {
    peers: HashMap<NodeId, String>,
    client: reqwest::Client,
}

impl NetworkRpc {
    pub fn new(peers: HashMap<NodeId, String>) -> Self {
        Self {
            peers,
            client: http::build_client(RAFT_RPC_CONNECT_TIMEOUT, RAFT_RPC_REQUEST_TIMEOUT),
        }
    }

    fn peer_addr(&self, target: NodeId) -> Result<&str> {
        self.peers
            .get(&target)
            .map(String::as_str)
            .ok_or(BlockFsError::NodeNotFound(target))
    }
}

#[async_trait::async_trait]
impl RaftRpc for NetworkRpc {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let addr = self.peer_addr(target)?;
        http::post_json(&self.client, addr, "raft/request_vote", &request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let addr = self.peer_addr(target)?;
        http::post_json(&self.client, addr, "raft/append_entries", &request).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let addr = self.peer_addr(target)?;
        http::post_json(&self.client, addr, "raft/install_snapshot", &request).await
    }
}

/// Shared server state for Axum handlers.
#[derive(Clone)]
struct ServerState {
    raft: RaftHandle,
    service: Arc<MetadataService>,
}

/// A running metadata replica.
pub struct MetadataServer {
    service: Arc<MetadataService>,
    raft: RaftHandle,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl MetadataServer {
    /// Bind `config.bind_addr` and start the replica.
    pub async fn start(
        node_id: NodeId,
        config: &MetadataConfig,
        data_dir: &Path,
        shutdown: &ShutdownCoordinator,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Self::start_with_listener(
            node_id,
            config,
            data_dir,
            listener,
            Arc::new(ChunkClient::new()),
            shutdown,
        )
        .await
    }

    /// Start the replica on an already bound listener.
    pub async fn start_with_listener(
        node_id: NodeId,
        config: &MetadataConfig,
        data_dir: &Path,
        listener: TcpListener,
        chunks: Arc<dyn ChunkRpc>,
        shutdown: &ShutdownCoordinator,
    ) -> Result<Self> {
        info!(node_id, "Starting metadata server");

        let raft_config = config.raft_config(node_id)?;
        let rpc = Arc::new(NetworkRpc::new(raft_config.peers.clone()));
        let (raft_node, command_rx) = RaftNode::new(
            raft_config,
            data_dir.join("raft"),
            MetadataStateMachine::new(),
            rpc,
        )?;
        let raft = raft_node.handle();

        let service = Arc::new(MetadataService::new(node_id, config, raft.clone(), chunks));
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(async move {
            raft_node.run(command_rx).await;
        }));
        tasks.push(tokio::spawn(Arc::clone(&service).run_heartbeat_loop(
            config.heartbeat_interval,
            shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(Arc::clone(&service).run_sync_read_loop(
            config.sync_read_interval,
            shutdown.subscribe(),
        )));

        let app = router(ServerState {
            raft: raft.clone(),
            service: Arc::clone(&service),
        });
        let local_addr = listener.local_addr()?;
        info!(node_id, addr = %local_addr, "Metadata server listening");

        let mut stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                error!(node_id, error = %e, "Metadata server failed");
            }
        }));

        Ok(Self {
            service,
            raft,
            local_addr,
            tasks,
        })
    }

    pub fn service(&self) -> &Arc<MetadataService> {
        &self.service
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop Raft and abort every task of this replica.
    pub async fn stop(self) {
        self.raft.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
        info!(node_id = self.service.node_id(), "Metadata server stopped");
    }
}

fn router(state: ServerState) -> Router {
    Router::new()
        // Raft RPC endpoints
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        // Metadata API endpoints
        .route("/health", get(health_check))
        .route("/metadata/register", post(handle_register))
        .route("/metadata/create", post(handle_create))
        .route("/metadata/open", post(handle_open))
        .route("/metadata/fetch_block_addrs", post(handle_fetch_block_addrs))
        .route("/metadata/locs_validity_notify", post(handle_locs_validity_notify))
        .route("/metadata/rename", post(handle_rename))
        .route("/metadata/fetch_file_info", post(handle_fetch_file_info))
        .route("/metadata/is_leader", get(handle_is_leader))
        .with_state(state)
}

// API Handlers

async fn health_check() -> &'static str {
    "OK"
}

async fn handle_request_vote(
    State(state): State<ServerState>,
    Json(request): Json<RequestVoteRequest>,
) -> Result<Json<RequestVoteResponse>> {
    Ok(Json(state.raft.request_vote(request).await?))
}

async fn handle_append_entries(
    State(state): State<ServerState>,
    Json(request): Json<AppendEntriesRequest>,
) -> Result<Json<AppendEntriesResponse>> {
    Ok(Json(state.raft.append_entries(request).await?))
}

async fn handle_install_snapshot(
    State(state): State<ServerState>,
    Json(request): Json<InstallSnapshotRequest>,
) -> Result<Json<InstallSnapshotResponse>> {
    Ok(Json(state.raft.install_snapshot(request).await?))
}

async fn handle_register(
    State(state): State<ServerState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    Ok(Json(state.service.register(request).await?))
}

async fn handle_create(
    State(state): State<ServerState>,
    Json(request): Json<CreateRequest>,
) -> Result<Json<CreateResponse>> {
    Ok(Json(state.service.create(request).await?))
}

async fn handle_open(
    State(state): State<ServerState>,
    Json(request): Json<OpenRequest>,
) -> Result<Json<OpenResponse>> {
    Ok(Json(state.service.open(request).await?))
}

async fn handle_fetch_block_addrs(
    State(state): State<ServerState>,
    Json(request): Json<FetchBlockAddrsRequest>,
) -> Result<Json<FetchBlockAddrsResponse>> {
    Ok(Json(state.service.fetch_block_addrs(request).await?))
}

async fn handle_locs_validity_notify(
    State(state): State<ServerState>,
    Json(request): Json<LocsValidityNotifyRequest>,
) -> Result<Json<Ack>> {
    Ok(Json(state.service.locs_validity_notify(request).await?))
}

async fn handle_rename(
    State(state): State<ServerState>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<Ack>> {
    Ok(Json(state.service.rename(request).await?))
}

async fn handle_fetch_file_info(
    State(state): State<ServerState>,
    Json(request): Json<FetchFileInfoRequest>,
) -> Result<Json<FetchFileInfoResponse>> {
    Ok(Json(state.service.fetch_file_info(request).await?))
}

async fn handle_is_leader(State(state): State<ServerState>) -> Result<Json<IsLeaderResponse>> {
    Ok(Json(state.service.is_leader().await?))
}
