//! Core type definitions for blockfs.
//!
//! # Key Types
//!
//! - [`BlockId`]: Unique identifier for a file block (UUID-based)
//! - [`Loc`]: Integer handle the metadata service assigns to a registered chunk server
//! - [`FetchOp`]: Which replicas a block-address lookup should return
//! - [`FileInfo`]: Name and size pair returned by listings
//!
//! # Paths
//!
//! Paths are plain strings. A trailing `/` marks a directory and `/` is the root.
//!
//! ```rust
//! use blockfs::types::{is_dir, parent_dir};
//!
//! assert!(is_dir("/doc/"));
//! assert_eq!(parent_dir("/doc/LICENSE"), "/doc/");
//! assert_eq!(parent_dir("/doc/"), "/");
//! ```
//!
//! # Working with Blocks
//!
//! ```rust
//! use blockfs::types::BlockId;
//!
//! let block_id = BlockId::new();
//! let same_id = BlockId::from_bytes(*block_id.as_bytes());
//! assert_eq!(block_id, same_id);
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default byte size of a block.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Default number of replicas per block.
pub const DEFAULT_REPLICA_FACTOR: usize = 3;

/// The root directory.
pub const ROOT_PATH: &str = "/";

/// Unique identifier for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub Uuid);

impl BlockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Draw a version-4 id from the given random source.
    pub fn from_rng<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let bytes: [u8; 16] = rng.gen();
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse a BlockId from a string representation.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chunk server slot assigned at registration.
pub type Loc = u64;

/// Unique identifier for a metadata replica.
pub type NodeId = u64;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Replica selection for block-address lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchOp {
    /// Valid replicas, for reading.
    Get,
    /// Reserved replicas still waiting for their payload.
    Put,
    /// Valid replicas, for deletion. Tombstones the file.
    Remove,
}

impl std::fmt::Display for FetchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchOp::Get => write!(f, "get"),
            FetchOp::Put => write!(f, "put"),
            FetchOp::Remove => write!(f, "remove"),
        }
    }
}

/// A namespace entry as seen by listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Whether the path names a directory.
pub fn is_dir(path: &str) -> bool {
    path.ends_with('/')
}

/// Directory that must exist before `path` can be created.
///
/// For `/a/b` this is `/a/`; for `/a/b/` it is `/a/`.
pub fn parent_dir(path: &str) -> &str {
    let trimmed = if is_dir(path) && path.len() > 1 {
        &path[..path.len() - 1]
    } else {
        path
    };
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[..=idx],
        None => ROOT_PATH,
    }
}

/// Number of blocks needed for `size` bytes, or `None` if it does not fit a `usize`.
pub fn block_count(size: u64, block_size: u64) -> Option<usize> {
    if block_size == 0 {
        return Some(0);
    }
    usize::try_from(size.div_ceil(block_size)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_block_id_creation() {
        let id1 = BlockId::new();
        let id2 = BlockId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_block_id_from_seeded_rng_is_deterministic() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        assert_eq!(BlockId::from_rng(&mut a), BlockId::from_rng(&mut b));
        assert_ne!(BlockId::from_rng(&mut a), BlockId::from_rng(&mut a));
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/LICENSE"), "/");
        assert_eq!(parent_dir("/doc/LICENSE"), "/doc/");
        assert_eq!(parent_dir("/doc/"), "/");
        assert_eq!(parent_dir("/a/b/c/"), "/a/b/");
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(0, 64), Some(0));
        assert_eq!(block_count(64, 64), Some(1));
        assert_eq!(block_count(200, 64), Some(4));
        assert_eq!(block_count(4097, DEFAULT_BLOCK_SIZE), Some(2));
        assert_eq!(block_count(u64::MAX, 1), usize::try_from(u64::MAX).ok());
    }

    #[test]
    fn test_fetch_op_wire_name() {
        assert_eq!(serde_json::to_string(&FetchOp::Remove).unwrap(), "\"remove\"");
    }
}
