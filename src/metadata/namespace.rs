//! Path table: every file and directory keyed by its full path.

use crate::error::{BlockFsError, Result};
use crate::types::{is_dir, parent_dir, BlockId, FileInfo, ROOT_PATH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Blocks and byte size of one path. Directories carry no blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub blocks: Vec<BlockId>,
    pub size: u64,
}

/// Flat path → entry map. The root directory is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    entries: BTreeMap<String, FileEntry>,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(ROOT_PATH.to_string(), FileEntry::default());
        Self { entries }
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fails unless `path` is absent and its parent directory exists.
    pub fn check_create(&self, path: &str) -> Result<()> {
        if !path.starts_with('/') {
            return Err(BlockFsError::InvalidOperation(format!(
                "path {} is not absolute",
                path
            )));
        }
        if self.contains(path) {
            return Err(BlockFsError::AlreadyExists(path.to_string()));
        }
        let parent = parent_dir(path);
        if !self.contains(parent) {
            return Err(BlockFsError::NotFound(format!(
                "parent dir {} of {}",
                parent, path
            )));
        }
        Ok(())
    }

    pub fn insert(&mut self, path: String, entry: FileEntry) {
        self.entries.insert(path, entry);
    }

    /// The entry of an existing file.
    pub fn open(&self, path: &str) -> Result<&FileEntry> {
        let entry = self
            .get(path)
            .ok_or_else(|| BlockFsError::NotFound(path.to_string()))?;
        if is_dir(path) {
            return Err(BlockFsError::InvalidOperation(format!(
                "{} is a directory",
                path
            )));
        }
        Ok(entry)
    }

    /// Drop a path. The root cannot be removed.
    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        if path == ROOT_PATH {
            return None;
        }
        self.entries.remove(path)
    }

    /// Move a file entry to a new path. Directories cannot be renamed.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        if !self.contains(old_path) {
            return Err(BlockFsError::NotFound(old_path.to_string()));
        }
        if is_dir(old_path) || is_dir(new_path) {
            return Err(BlockFsError::InvalidOperation(
                "only file to file rename is supported".into(),
            ));
        }
        if old_path == new_path {
            return Ok(());
        }
        self.check_create(new_path)?;

        if let Some(entry) = self.entries.remove(old_path) {
            self.entries.insert(new_path.to_string(), entry);
        }
        Ok(())
    }

    /// A single entry for a file, or every path under a directory prefix.
    ///
    /// Directory listings are a flat prefix scan and include the directory itself.
    pub fn file_info(&self, path: &str) -> Result<Vec<FileInfo>> {
        let entry = self
            .get(path)
            .ok_or_else(|| BlockFsError::NotFound(path.to_string()))?;

        if !is_dir(path) {
            return Ok(vec![FileInfo {
                name: path.to_string(),
                size: entry.size,
            }]);
        }

        Ok(self
            .entries
            .range(path.to_string()..)
            .take_while(|(name, _)| name.starts_with(path))
            .map(|(name, entry)| FileInfo {
                name: name.clone(),
                size: entry.size,
            })
            .collect())
    }

    /// Whether any entry still lists `block`.
    pub fn references(&self, block: &BlockId) -> bool {
        self.entries.values().any(|e| e.blocks.contains(block))
    }
}
