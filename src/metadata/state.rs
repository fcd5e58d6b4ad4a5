//! The replicated metadata image and the queries and updates on it.

use super::namespace::{FileEntry, Namespace};
use super::replicas::ReplicaDirectory;
use crate::error::{BlockFsError, Result};
use crate::types::{is_dir, BlockId, FetchOp};
use serde::{Deserialize, Serialize};

/// Everything the metadata service replicates, proposed as one blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataState {
    pub namespace: Namespace,
    pub replicas: ReplicaDirectory,
}

/// Result of resolving one block of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAddrs {
    /// `None` only for the tombstoning fetch of a file without blocks.
    pub block_id: Option<BlockId>,
    pub addrs: Vec<String>,
    /// Whether this fetch is the last one of a remove pass.
    pub tombstones: bool,
}

impl MetadataState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| BlockFsError::Deserialization(e.to_string()))
    }

    /// Replica addresses relevant to `op` for block `index` of `path`.
    ///
    /// GET and REMOVE see valid replicas, PUT sees the reserved ones.
    pub fn block_addrs(&self, path: &str, index: u64, op: FetchOp) -> Result<BlockAddrs> {
        let entry = self
            .namespace
            .get(path)
            .ok_or_else(|| BlockFsError::NotFound(path.to_string()))?;
        if is_dir(path) {
            return Err(BlockFsError::InvalidOperation(format!(
                "cannot fetch block addresses for directory {}",
                path
            )));
        }

        let block_count = entry.blocks.len() as u64;
        if op == FetchOp::Remove && block_count == 0 && index == 0 {
            return Ok(BlockAddrs {
                block_id: None,
                addrs: Vec::new(),
                tombstones: true,
            });
        }

        let block_id = *entry.blocks.get(index as usize).ok_or_else(|| {
            BlockFsError::InvalidOperation(format!(
                "index {} out of range {}",
                index, block_count
            ))
        })?;
        if self.replicas.replicas(&block_id).is_none() {
            return Err(BlockFsError::NotFound(format!("block {}", block_id)));
        }

        let addrs = match op {
            FetchOp::Get | FetchOp::Remove => self.replicas.addrs_with_validity(&block_id, true),
            FetchOp::Put => self.replicas.addrs_with_validity(&block_id, false),
        };

        Ok(BlockAddrs {
            block_id: Some(block_id),
            addrs,
            tombstones: op == FetchOp::Remove && index + 1 == block_count,
        })
    }

    /// Delete a file entry and drop replica sets nothing can reach any more.
    pub fn tombstone(&mut self, path: &str) -> Option<FileEntry> {
        let entry = self.namespace.remove(path)?;
        for block in &entry.blocks {
            self.collect_block(block);
        }
        Some(entry)
    }

    /// Forget a block that no file references and no replica holds.
    pub fn collect_block(&mut self, block: &BlockId) -> bool {
        if self.namespace.references(block) || self.replicas.has_valid_replica(block) {
            return false;
        }
        self.replicas.remove_block(block).is_some()
    }
}
