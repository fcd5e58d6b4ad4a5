//! Chunk server implementation.

use super::ChunkStore;
use crate::client::chunk::HeartbeatResponse;
use crate::client::metadata::MetadataClient;
use crate::config::{ChunkConfig, ClientConfig};
use crate::error::{BlockFsError, Result};
use crate::observability;
use crate::shutdown::ShutdownCoordinator;
use crate::types::BlockId;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause between registration attempts.
const REGISTER_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Block operations of one chunk server.
#[derive(Clone)]
pub struct ChunkServer {
    store: Arc<ChunkStore>,
    /// Block size handed out at registration; zero until then.
    block_size: Arc<AtomicU64>,
}

impl ChunkServer {
    pub fn new(store: ChunkStore) -> Self {
        Self {
            store: Arc::new(store),
            block_size: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn block_size(&self) -> u64 {
        self.block_size.load(Ordering::Relaxed)
    }

    pub fn set_block_size(&self, block_size: u64) {
        self.block_size.store(block_size, Ordering::Relaxed);
    }

    pub fn write(&self, block_id: BlockId, data: &[u8]) -> Result<()> {
        let block_size = self.block_size();
        if block_size > 0 && data.len() as u64 > block_size {
            return Err(BlockFsError::InvalidOperation(format!(
                "{} bytes exceed block size {}",
                data.len(),
                block_size
            )));
        }
        self.store.write(block_id, data)?;
        observability::record_chunk_bytes("write", data.len());
        Ok(())
    }

    pub fn read(&self, block_id: BlockId) -> Result<Vec<u8>> {
        let data = self.store.read(block_id)?;
        observability::record_chunk_bytes("read", data.len());
        Ok(data)
    }

    pub fn remove(&self, block_id: BlockId) -> Result<()> {
        self.store.remove(block_id)
    }

    pub fn heartbeat(&self) -> HeartbeatResponse {
        HeartbeatResponse {
            block_count: self.store.block_count(),
        }
    }

    /// Register `addr` with the metadata leader and adopt its block size.
    ///
    /// Tries once per second, at most `retries` times.
    pub async fn register(&self, metadata: &MetadataClient, addr: &str, retries: u32) -> Result<u64> {
        let mut last_error = None;
        for attempt in 1..=retries.max(1) {
            match metadata.register(addr).await {
                Ok(response) => {
                    self.set_block_size(response.block_size);
                    info!(
                        addr,
                        loc = response.loc,
                        block_size = response.block_size,
                        "Registered with metadata service"
                    );
                    return Ok(response.loc);
                }
                Err(e) => {
                    warn!(addr, attempt, error = %e, "Registration failed");
                    last_error = Some(e);
                }
            }
            tokio::time::sleep(REGISTER_RETRY_INTERVAL).await;
        }
        Err(last_error.unwrap_or_else(|| BlockFsError::Internal("registration never ran".into())))
    }
}

/// A running chunk server.
pub struct ChunkServerHandle {
    server: ChunkServer,
    local_addr: SocketAddr,
    advertise_addr: String,
    shutdown: ShutdownCoordinator,
    serve: JoinHandle<()>,
    registration: JoinHandle<()>,
}

impl ChunkServerHandle {
    pub fn server(&self) -> &ChunkServer {
        &self.server
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address the metadata service knows this server by.
    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    /// Signal shutdown and wait for in-flight requests to drain.
    ///
    /// The HTTP server is aborted if it outlives the coordinator's timeout.
    pub async fn stop(self) {
        self.shutdown.shutdown();
        let _ = self.registration.await;

        let mut serve = self.serve;
        match tokio::time::timeout(self.shutdown.timeout(), &mut serve).await {
            Ok(Err(e)) if e.is_panic() => error!(error = %e, "Chunk server panicked"),
            Ok(_) => {}
            Err(_) => {
                warn!(addr = %self.advertise_addr, "Chunk server did not drain in time, aborting");
                serve.abort();
            }
        }
        info!(addr = %self.advertise_addr, "Chunk server stopped");
    }
}

/// Bind `config.bind_addr` and run a chunk server.
pub async fn start_chunk_server(
    config: &ChunkConfig,
    client: &ClientConfig,
    data_dir: &FsPath,
    shutdown: &ShutdownCoordinator,
) -> Result<ChunkServerHandle> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    start_chunk_server_with_listener(config, client, data_dir, listener, shutdown).await
}

/// Run a chunk server on an already bound listener.
pub async fn start_chunk_server_with_listener(
    config: &ChunkConfig,
    client: &ClientConfig,
    data_dir: &FsPath,
    listener: TcpListener,
    shutdown: &ShutdownCoordinator,
) -> Result<ChunkServerHandle> {
    let store = ChunkStore::open(data_dir.join("blocks"), config.cache_size)?;
    let server = ChunkServer::new(store);
    let local_addr = listener.local_addr()?;
    let advertise_addr = config
        .advertise_addr
        .clone()
        .unwrap_or_else(|| local_addr.to_string());

    let app = router(server.clone());
    let mut stop = shutdown.subscribe();
    let serve = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await;
        if let Err(e) = served {
            error!(error = %e, "Chunk server failed");
        }
    });
    info!(addr = %local_addr, advertise = %advertise_addr, "Chunk server listening");

    let metadata = MetadataClient::with_addrs(config.metadata_addrs.clone(), client);
    let registering = server.clone();
    let addr = advertise_addr.clone();
    let retries = config.register_retries;
    let mut stop = shutdown.subscribe();
    let registration = tokio::spawn(async move {
        tokio::select! {
            registered = registering.register(&metadata, &addr, retries) => {
                if let Err(e) = registered {
                    error!(addr = %addr, error = %e, "Giving up on registration");
                }
            }
            _ = stop.recv() => debug!(addr = %addr, "Registration cancelled by shutdown"),
        }
    });

    Ok(ChunkServerHandle {
        server,
        local_addr,
        advertise_addr,
        shutdown: shutdown.clone(),
        serve,
        registration,
    })
}

fn router(server: ChunkServer) -> Router {
    Router::new()
        .route(
            "/block/:block_id",
            get(handle_read).put(handle_write).delete(handle_remove),
        )
        .route("/heartbeat", get(handle_heartbeat))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::disable())
        .with_state(server)
}

// Handlers

async fn health_check() -> &'static str {
    "OK"
}

async fn handle_heartbeat(State(server): State<ChunkServer>) -> Json<HeartbeatResponse> {
    Json(server.heartbeat())
}

async fn handle_write(
    State(server): State<ChunkServer>,
    Path(block_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode> {
    let block_id = parse_block_id(&block_id)?;
    server.write(block_id, &body)?;
    debug!(block_id = %block_id, size = body.len(), "Stored block");
    Ok(StatusCode::CREATED)
}

async fn handle_read(
    State(server): State<ChunkServer>,
    Path(block_id): Path<String>,
) -> Result<Bytes> {
    let block_id = parse_block_id(&block_id)?;
    Ok(Bytes::from(server.read(block_id)?))
}

async fn handle_remove(
    State(server): State<ChunkServer>,
    Path(block_id): Path<String>,
) -> Result<StatusCode> {
    let block_id = parse_block_id(&block_id)?;
    server.remove(block_id)?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_block_id(s: &str) -> Result<BlockId> {
    BlockId::parse(s)
        .map_err(|e| BlockFsError::InvalidOperation(format!("Invalid block ID: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_chunk_server_write_read() {
        let dir = tempdir().unwrap();
        let server = ChunkServer::new(ChunkStore::open(dir.path(), 1024 * 1024).unwrap());

        let block_id = BlockId::new();
        server.write(block_id, b"Hello, block store!").unwrap();
        assert_eq!(server.read(block_id).unwrap(), b"Hello, block store!");
        assert_eq!(server.heartbeat().block_count, 1);

        server.remove(block_id).unwrap();
        assert!(matches!(server.read(block_id), Err(BlockFsError::NotFound(_))));
        assert_eq!(server.heartbeat().block_count, 0);
    }

    #[test]
    fn test_rejects_oversized_block() {
        let dir = tempdir().unwrap();
        let server = ChunkServer::new(ChunkStore::open(dir.path(), 1024).unwrap());
        server.set_block_size(4);

        let err = server.write(BlockId::new(), b"too long").unwrap_err();
        assert!(matches!(err, BlockFsError::InvalidOperation(_)));
        server.write(BlockId::new(), b"fits").unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_and_closes_listener() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ChunkConfig {
            bind_addr: listener.local_addr().unwrap(),
            metadata_addrs: Vec::new(),
            register_retries: 100,
            ..Default::default()
        };
        let shutdown = ShutdownCoordinator::with_timeout(Duration::from_secs(5));
        let handle = start_chunk_server_with_listener(
            &config,
            &ClientConfig::default(),
            dir.path(),
            listener,
            &shutdown,
        )
        .await
        .unwrap();
        let addr = handle.local_addr();

        let health = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
        assert!(health.status().is_success());

        // Registration is still retrying; stopping must not wait it out.
        tokio::time::timeout(Duration::from_secs(3), handle.stop())
            .await
            .unwrap();
        assert!(shutdown.is_shutting_down());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[test]
    fn test_parse_block_id() {
        let id = BlockId::new();
        assert_eq!(parse_block_id(&id.to_string()).unwrap(), id);
        assert!(matches!(
            parse_block_id("not-a-uuid"),
            Err(BlockFsError::InvalidOperation(_))
        ));
    }
}
