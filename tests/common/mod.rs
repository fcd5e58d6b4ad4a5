//! In-process blockfs clusters for integration tests.
//!
//! Every node listens on a loopback port bound before startup, so peer lists
//! can be built up front. Each node has its own shutdown coordinator, which
//! lets a test kill a single chunk server or metadata replica.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use blockfs::chunk::{start_chunk_server_with_listener, ChunkServerHandle};
use blockfs::client::{ChunkClient, Client};
use blockfs::config::{ChunkConfig, ClientConfig, MetadataConfig};
use blockfs::metadata::{MetadataServer, MetadataState};
use blockfs::shutdown::ShutdownCoordinator;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const BLOCK_SIZE: u64 = 64;
pub const REPLICA_FACTOR: usize = 3;
pub const WAIT: Duration = Duration::from_secs(15);

pub struct MetadataNode {
    pub server: MetadataServer,
    pub addr: String,
    shutdown: ShutdownCoordinator,
}

pub struct ChunkNode {
    pub handle: ChunkServerHandle,
}

impl ChunkNode {
    pub fn addr(&self) -> &str {
        self.handle.advertise_addr()
    }
}

pub struct TestCluster {
    pub metadata: Vec<MetadataNode>,
    pub chunks: Vec<Option<ChunkNode>>,
    pub metadata_addrs: Vec<String>,
    dir: TempDir,
}

/// Poll `check` every 50ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub fn client_config(metadata_addrs: &[String]) -> ClientConfig {
    ClientConfig {
        metadata_addrs: metadata_addrs.to_vec(),
        connect_rounds: 20,
        retry_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(5),
    }
}

fn metadata_config(addr: &str, peers: &[String]) -> MetadataConfig {
    MetadataConfig {
        bind_addr: addr.parse().unwrap(),
        raft_peers: peers.to_vec(),
        block_size: BLOCK_SIZE,
        replica_factor: REPLICA_FACTOR,
        heartbeat_interval: Duration::from_millis(200),
        sync_read_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

/// Wait until `GET /health` on `addr` answers OK.
pub async fn wait_healthy(addr: &str) {
    let url = format!("http://{}/health", addr);
    let healthy = eventually(WAIT, || {
        let url = url.clone();
        async move {
            match reqwest::get(&url).await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            }
        }
    })
    .await;
    assert!(healthy, "{} never became healthy", addr);
}

async fn bind_loopback() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

impl TestCluster {
    /// Start `metadata_replicas` metadata replicas, wait for a leader, then
    /// start `chunk_servers` chunk servers and wait for all of them to register.
    pub async fn start(metadata_replicas: usize, chunk_servers: usize) -> Self {
        let dir = TempDir::new().unwrap();

        let mut listeners = Vec::new();
        for _ in 0..metadata_replicas {
            listeners.push(bind_loopback().await);
        }
        let metadata_addrs: Vec<String> = listeners.iter().map(|(_, addr)| addr.clone()).collect();
        let peers: Vec<String> = metadata_addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| format!("{}={}", i + 1, addr))
            .collect();

        let mut metadata = Vec::new();
        for (i, (listener, addr)) in listeners.into_iter().enumerate() {
            let node_id = i as u64 + 1;
            let shutdown = ShutdownCoordinator::new();
            let server = MetadataServer::start_with_listener(
                node_id,
                &metadata_config(&addr, &peers),
                &dir.path().join(format!("metadata-{}", node_id)),
                listener,
                Arc::new(ChunkClient::with_timeouts(
                    Duration::from_millis(500),
                    Duration::from_secs(2),
                )),
                &shutdown,
            )
            .await
            .unwrap();
            metadata.push(MetadataNode {
                server,
                addr,
                shutdown,
            });
        }

        for node in &metadata {
            wait_healthy(&node.addr).await;
        }

        let mut cluster = Self {
            metadata,
            chunks: Vec::new(),
            metadata_addrs,
            dir,
        };
        let view = &cluster;
        assert!(
            eventually(WAIT, || async move { view.leader().await.is_some() }).await,
            "no metadata leader elected"
        );

        for _ in 0..chunk_servers {
            cluster.add_chunk_server().await;
        }
        cluster
    }

    /// Start one more chunk server and wait until the leader knows it.
    pub async fn add_chunk_server(&mut self) -> String {
        let index = self.chunks.len();
        let (listener, _) = bind_loopback().await;
        let shutdown = ShutdownCoordinator::with_timeout(Duration::from_secs(2));
        let config = ChunkConfig {
            bind_addr: listener.local_addr().unwrap(),
            metadata_addrs: self.metadata_addrs.clone(),
            register_retries: 30,
            ..Default::default()
        };
        let handle = start_chunk_server_with_listener(
            &config,
            &client_config(&self.metadata_addrs),
            &self.dir.path().join(format!("chunk-{}", index)),
            listener,
            &shutdown,
        )
        .await
        .unwrap();
        let addr = handle.advertise_addr().to_string();
        wait_healthy(&addr).await;
        self.chunks.push(Some(ChunkNode { handle }));

        let view = &*self;
        let wanted = addr.as_str();
        let registered = eventually(WAIT, || async move {
            match view.leader_state().await {
                Some(state) => state.replicas.loc_of(wanted).is_some(),
                None => false,
            }
        })
        .await;
        assert!(registered, "chunk server {} never registered", addr);
        addr
    }

    /// Stop chunk server `index` and wait for its listener to close.
    pub async fn kill_chunk_server(&mut self, index: usize) -> String {
        let node = self.chunks[index].take().expect("chunk server already stopped");
        let addr = node.addr().to_string();
        node.handle.stop().await;
        addr
    }

    /// Stop the current metadata leader and return its address.
    pub async fn kill_leader(&mut self) -> String {
        let mut index = None;
        for (i, node) in self.metadata.iter().enumerate() {
            if node.server.raft().is_leader().await {
                index = Some(i);
                break;
            }
        }
        let node = self.metadata.remove(index.expect("no metadata leader"));
        node.shutdown.shutdown();
        node.server.stop().await;
        node.addr
    }

    pub fn chunk_addrs(&self) -> Vec<String> {
        self.chunks
            .iter()
            .flatten()
            .map(|node| node.addr().to_string())
            .collect()
    }

    /// The replica that currently believes it leads, if any.
    pub async fn leader(&self) -> Option<&MetadataNode> {
        for node in &self.metadata {
            if node.server.raft().is_leader().await {
                return Some(node);
            }
        }
        None
    }

    pub async fn followers(&self) -> Vec<&MetadataNode> {
        let mut followers = Vec::new();
        for node in &self.metadata {
            if !node.server.raft().is_leader().await {
                followers.push(node);
            }
        }
        followers
    }

    pub async fn leader_state(&self) -> Option<MetadataState> {
        match self.leader().await {
            Some(node) => Some(node.server.service().state().await),
            None => None,
        }
    }

    pub fn client(&self) -> Client {
        Client::new(&client_config(&self.metadata_addrs))
    }

    pub async fn shutdown(mut self) {
        for index in 0..self.chunks.len() {
            if self.chunks[index].is_some() {
                self.kill_chunk_server(index).await;
            }
        }
        for node in self.metadata {
            node.shutdown.shutdown();
            node.server.stop().await;
        }
    }
}

/// `len` bytes of a repeating, position-dependent pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}
