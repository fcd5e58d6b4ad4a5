//! Local block storage for a chunk server.

use crate::error::{BlockFsError, Result};
use crate::types::BlockId;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

const CACHE_ENTRIES: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// Sidecar metadata written next to every block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBlock {
    pub id: BlockId,
    pub size: u64,
    /// CRC32 checksum.
    pub checksum: u32,
    /// SHA256 hash.
    pub sha256: [u8; 32],
}

impl StoredBlock {
    pub fn new(id: BlockId, data: &[u8]) -> Self {
        Self {
            id,
            size: data.len() as u64,
            checksum: crc32fast::hash(data),
            sha256: Sha256::digest(data).into(),
        }
    }

    /// Verify data against stored checksum.
    pub fn verify(&self, data: &[u8]) -> bool {
        crc32fast::hash(data) == self.checksum
    }

    /// Verify data against SHA256 hash.
    pub fn verify_sha256(&self, data: &[u8]) -> bool {
        let hash: [u8; 32] = Sha256::digest(data).into();
        hash == self.sha256
    }
}

/// Block files on local disk, with a read cache.
pub struct ChunkStore {
    /// Base directory for block files.
    data_dir: PathBuf,
    /// LRU cache for recently read or written blocks.
    cache: Mutex<LruCache<BlockId, Arc<Vec<u8>>>>,
    /// Cache budget in bytes.
    cache_size: usize,
    cache_bytes_used: Mutex<usize>,
    block_count: AtomicU64,
}

impl ChunkStore {
    /// Open (or create) a store rooted at `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P, cache_size: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        // Create subdirectories for sharding
        let mut existing = 0u64;
        for i in 0..256 {
            let dir = data_dir.join(format!("{:02x}", i));
            fs::create_dir_all(&dir)?;
            for entry in fs::read_dir(&dir)? {
                let name = entry?.file_name();
                if name.to_string_lossy().ends_with(".dat") {
                    existing += 1;
                }
            }
        }
        info!(path = %data_dir.display(), blocks = existing, "Opened chunk store");

        Ok(Self {
            data_dir,
            cache: Mutex::new(LruCache::new(CACHE_ENTRIES)),
            cache_size,
            cache_bytes_used: Mutex::new(0),
            block_count: AtomicU64::new(existing),
        })
    }

    /// Store `data` as block `block_id`, replacing any previous copy.
    pub fn write(&self, block_id: BlockId, data: &[u8]) -> Result<StoredBlock> {
        let path = self.block_path(block_id);
        let existed = path.exists();

        // Write data atomically
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        let meta = StoredBlock::new(block_id, data);
        fs::write(self.meta_path(block_id), serde_json::to_vec(&meta)?)?;

        if !existed {
            self.block_count.fetch_add(1, Ordering::Relaxed);
        }
        self.cache_put(block_id, data.to_vec());

        debug!(block_id = %block_id, size = data.len(), "Wrote block");
        Ok(meta)
    }

    /// Read block `block_id`, verifying it against its sidecar.
    pub fn read(&self, block_id: BlockId) -> Result<Vec<u8>> {
        if let Some(data) = self.cache_get(block_id) {
            return Ok(Arc::try_unwrap(data).unwrap_or_else(|arc| (*arc).clone()));
        }

        let mut file = File::open(self.block_path(block_id)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                BlockFsError::NotFound(format!("block {}", block_id))
            } else {
                e.into()
            }
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if let Some(meta) = self.meta(block_id)? {
            if !meta.verify(&data) || !meta.verify_sha256(&data) {
                error!(block_id = %block_id, "Checksum mismatch");
                return Err(BlockFsError::DataCorrupted(format!(
                    "block {} fails checksum verification",
                    block_id
                )));
            }
        }

        self.cache_put(block_id, data.clone());
        Ok(data)
    }

    /// Delete block `block_id`. Absent blocks are `NotFound`.
    pub fn remove(&self, block_id: BlockId) -> Result<()> {
        self.cache_remove(block_id);

        match fs::remove_file(self.block_path(block_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BlockFsError::NotFound(format!("block {}", block_id)));
            }
            Err(e) => return Err(e.into()),
        }
        let _ = fs::remove_file(self.meta_path(block_id));
        self.block_count.fetch_sub(1, Ordering::Relaxed);

        debug!(block_id = %block_id, "Removed block");
        Ok(())
    }

    pub fn contains(&self, block_id: BlockId) -> bool {
        self.block_path(block_id).exists()
    }

    /// Number of blocks on disk.
    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Relaxed)
    }

    fn meta(&self, block_id: BlockId) -> Result<Option<StoredBlock>> {
        match fs::read(self.meta_path(block_id)) {
            Ok(json) => Ok(Some(serde_json::from_slice(&json)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // Path helpers

    fn shard_dir(&self, block_id: BlockId) -> PathBuf {
        self.data_dir.join(format!("{:02x}", block_id.as_bytes()[0]))
    }

    fn block_path(&self, block_id: BlockId) -> PathBuf {
        self.shard_dir(block_id).join(format!("{}.dat", block_id))
    }

    fn meta_path(&self, block_id: BlockId) -> PathBuf {
        self.shard_dir(block_id).join(format!("{}.meta", block_id))
    }

    // Cache operations

    fn cache_get(&self, block_id: BlockId) -> Option<Arc<Vec<u8>>> {
        self.cache.lock().get(&block_id).map(Arc::clone)
    }

    fn cache_put(&self, block_id: BlockId, data: Vec<u8>) {
        let data_len = data.len();
        if data_len > self.cache_size {
            return;
        }

        let mut cache = self.cache.lock();
        let mut bytes_used = self.cache_bytes_used.lock();
        if let Some(old) = cache.pop(&block_id) {
            *bytes_used = bytes_used.saturating_sub(old.len());
        }

        // Evict until we have room
        while *bytes_used + data_len > self.cache_size {
            match cache.pop_lru() {
                Some((_, evicted)) => *bytes_used = bytes_used.saturating_sub(evicted.len()),
                None => break,
            }
        }

        *bytes_used += data_len;
        if let Some((_, evicted)) = cache.push(block_id, Arc::new(data)) {
            *bytes_used = bytes_used.saturating_sub(evicted.len());
        }
    }

    fn cache_remove(&self, block_id: BlockId) {
        if let Some(data) = self.cache.lock().pop(&block_id) {
            let mut bytes_used = self.cache_bytes_used.lock();
            *bytes_used = bytes_used.saturating_sub(data.len());
        }
    }
}
