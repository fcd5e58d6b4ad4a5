//! Client library for blockfs.
//!
//! [`Client`] splits files into blocks, asks the metadata service where each
//! block lives and moves the bytes to and from chunk servers directly.
//!
//! ```no_run
//! use blockfs::client::Client;
//! use blockfs::config::ClientConfig;
//!
//! # async fn example() -> blockfs::Result<()> {
//! let client = Client::new(&ClientConfig {
//!     metadata_addrs: vec!["127.0.0.1:9000".into()],
//!     ..Default::default()
//! });
//! client.mkdir("/doc/").await?;
//! client.put_bytes("/doc/hello", b"hello world").await?;
//! assert_eq!(client.get_bytes("/doc/hello").await?, b"hello world");
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod http;
pub mod metadata;

pub use chunk::{ChunkClient, ChunkRpc};
pub use metadata::MetadataClient;

use crate::config::ClientConfig;
use crate::error::{BlockFsError, Result};
use crate::types::{is_dir, FetchOp, FileInfo};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File-level API over the metadata service and chunk servers.
pub struct Client {
    metadata: MetadataClient,
    chunks: Arc<dyn ChunkRpc>,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Self {
        let chunks = ChunkClient::with_timeouts(http::DEFAULT_CONNECT_TIMEOUT, config.request_timeout);
        Self::with_chunks(MetadataClient::new(config), Arc::new(chunks))
    }

    pub fn with_chunks(metadata: MetadataClient, chunks: Arc<dyn ChunkRpc>) -> Self {
        Self { metadata, chunks }
    }

    pub fn metadata(&self) -> &MetadataClient {
        &self.metadata
    }

    /// Upload the local file at `local` to `remote`.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let data = tokio::fs::read(local).await?;
        self.put_bytes(remote, &data).await
    }

    /// Store `data` as a new file.
    ///
    /// Replica write failures are not errors: those replicas stay invalid and
    /// are dealt with by the metadata service.
    pub async fn put_bytes(&self, remote: &str, data: &[u8]) -> Result<()> {
        let created = self.metadata.create(remote, data.len() as u64).await?;
        let block_size = created.block_size.max(1) as usize;

        for (index, block) in data.chunks(block_size).enumerate() {
            let found = self
                .metadata
                .fetch_block_addrs(remote, index as u64, FetchOp::Put)
                .await?;
            let Some(block_id) = found.block_id else {
                continue;
            };

            let writes = found.addrs.iter().map(|addr| {
                let chunks = Arc::clone(&self.chunks);
                let payload = block.to_vec();
                async move { (addr, chunks.write(addr, block_id, payload).await) }
            });
            let mut validity = BTreeMap::new();
            for (addr, result) in join_all(writes).await {
                match result {
                    Ok(()) => {
                        validity.insert(addr.clone(), true);
                    }
                    Err(e) => warn!(addr = %addr, block_id = %block_id, error = %e, "Replica write failed"),
                }
            }

            debug!(path = %remote, index, block_id = %block_id, written = validity.len(), "Wrote block");
            self.metadata.locs_validity_notify(block_id, validity).await?;
        }

        info!(path = %remote, size = data.len(), "Put file");
        Ok(())
    }

    /// Download `remote` into the local file `local`.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        let data = self.get_bytes(remote).await?;
        tokio::fs::write(local, data).await?;
        Ok(())
    }

    /// Read a whole file, taking each block from the first replica that answers.
    pub async fn get_bytes(&self, remote: &str) -> Result<Vec<u8>> {
        let opened = self.metadata.open(remote).await?;
        let mut data = Vec::new();

        for index in 0..opened.block_count {
            let found = self
                .metadata
                .fetch_block_addrs(remote, index, FetchOp::Get)
                .await?;
            let block_id = found
                .block_id
                .ok_or_else(|| BlockFsError::NotFound(format!("{} block {}", remote, index)))?;

            let mut block = None;
            for addr in &found.addrs {
                match self.chunks.read(addr, block_id).await {
                    Ok(bytes) => {
                        block = Some(bytes);
                        break;
                    }
                    Err(e) => warn!(addr = %addr, block_id = %block_id, error = %e, "Replica read failed"),
                }
            }
            match block {
                Some(bytes) => data.extend_from_slice(&bytes),
                None => {
                    return Err(BlockFsError::DataCorrupted(format!(
                        "no readable replica of {} block {}",
                        remote, index
                    )))
                }
            }
        }

        Ok(data)
    }

    /// Delete a file and its replicas.
    pub async fn remove(&self, remote: &str) -> Result<()> {
        let opened = self.metadata.open(remote).await?;

        // The fetch for the last index removes the entry, so empty files still need one.
        for index in 0..opened.block_count.max(1) {
            let found = self
                .metadata
                .fetch_block_addrs(remote, index, FetchOp::Remove)
                .await?;
            let Some(block_id) = found.block_id else {
                continue;
            };

            let removals = found.addrs.iter().map(|addr| {
                let chunks = Arc::clone(&self.chunks);
                async move { (addr, chunks.remove(addr, block_id).await) }
            });
            let mut validity = BTreeMap::new();
            for (addr, result) in join_all(removals).await {
                match result {
                    Ok(()) => {
                        validity.insert(addr.clone(), false);
                    }
                    Err(e) => warn!(addr = %addr, block_id = %block_id, error = %e, "Replica removal failed"),
                }
            }
            self.metadata.locs_validity_notify(block_id, validity).await?;
        }

        info!(path = %remote, "Removed file");
        Ok(())
    }

    /// Name and size of a file.
    pub async fn stat(&self, remote: &str) -> Result<FileInfo> {
        if is_dir(remote) {
            return Err(BlockFsError::InvalidOperation(format!(
                "{} is a directory",
                remote
            )));
        }
        self.metadata
            .fetch_file_info(remote)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BlockFsError::NotFound(remote.to_string()))
    }

    /// A directory and everything below it, sorted by name.
    pub async fn list(&self, remote: &str) -> Result<Vec<FileInfo>> {
        if !is_dir(remote) {
            return Err(BlockFsError::InvalidOperation(format!(
                "{} is not a directory",
                remote
            )));
        }
        let mut infos = self.metadata.fetch_file_info(remote).await?;
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    pub async fn mkdir(&self, remote: &str) -> Result<()> {
        if !is_dir(remote) {
            return Err(BlockFsError::InvalidOperation(format!(
                "directory path {} must end with /",
                remote
            )));
        }
        self.metadata.create(remote, 0).await?;
        Ok(())
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.metadata.rename(old_path, new_path).await
    }
}
