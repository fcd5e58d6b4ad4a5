//! RPC client for chunk servers.

use super::http::{self, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::error::Result;
use crate::types::BlockId;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body of `GET /heartbeat`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub block_count: u64,
}

/// Block operations against a chunk server, addressed by `host:port`.
#[async_trait::async_trait]
pub trait ChunkRpc: Send + Sync {
    async fn read(&self, addr: &str, block_id: BlockId) -> Result<Vec<u8>>;

    async fn write(&self, addr: &str, block_id: BlockId, data: Vec<u8>) -> Result<()>;

    async fn remove(&self, addr: &str, block_id: BlockId) -> Result<()>;

    /// Liveness probe; returns how many blocks the server holds.
    async fn heartbeat(&self, addr: &str) -> Result<u64>;
}

/// HTTP implementation of [`ChunkRpc`].
#[derive(Clone)]
pub struct ChunkClient {
    client: Client,
}

impl ChunkClient {
    /// Create a new chunk client with default timeouts.
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeouts(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            client: http::build_client(connect_timeout, request_timeout),
        }
    }

    fn block_url(addr: &str, block_id: BlockId) -> String {
        format!("http://{}/block/{}", addr, block_id)
    }
}

impl Default for ChunkClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChunkRpc for ChunkClient {
    async fn read(&self, addr: &str, block_id: BlockId) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(Self::block_url(addr, block_id))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(http::read_error(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn write(&self, addr: &str, block_id: BlockId, data: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .put(Self::block_url(addr, block_id))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(http::read_error(response).await);
        }
        Ok(())
    }

    async fn remove(&self, addr: &str, block_id: BlockId) -> Result<()> {
        let response = self
            .client
            .delete(Self::block_url(addr, block_id))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(http::read_error(response).await);
        }
        Ok(())
    }

    async fn heartbeat(&self, addr: &str) -> Result<u64> {
        let response: HeartbeatResponse = http::get_json(&self.client, addr, "heartbeat").await?;
        Ok(response.block_count)
    }
}
