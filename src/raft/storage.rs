//! RocksDB persistence for term, vote, log entries and the latest snapshot.

use super::{LogEntry, PersistentState};
use crate::error::{BlockFsError, Result};
use crate::types::{LogIndex, Term};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const PERSISTENT_STATE_KEY: &[u8] = b"raft_persistent_state";
const LOG_PREFIX: &[u8] = b"raft_log_";
const SNAPSHOT_KEY: &[u8] = b"raft_snapshot";
const SNAPSHOT_META_KEY: &[u8] = b"raft_snapshot_meta";

/// Position covered by a stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
}

pub struct RaftStorage {
    db: DB,
}

impl RaftStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    pub fn load_persistent_state(&self) -> Result<Option<PersistentState>> {
        match self.db.get(PERSISTENT_STATE_KEY)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Term and vote must hit disk before a vote or append is acknowledged.
    pub fn save_persistent_state(&self, state: &PersistentState) -> Result<()> {
        self.db.put(PERSISTENT_STATE_KEY, bincode::serialize(state)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn append_log_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put(log_key(entry.index), bincode::serialize(entry)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn load_log_entries_from(&self, start_index: LogIndex) -> Result<Vec<LogEntry>> {
        let start = log_key(start_index);
        let mut entries = Vec::new();

        for item in self.db.iterator(IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            entries.push(bincode::deserialize::<LogEntry>(&value)?);
        }

        Ok(entries)
    }

    /// Delete `from_index` and every later entry.
    pub fn truncate_log_from(&self, from_index: LogIndex) -> Result<()> {
        self.delete_log_range(from_index, None)
    }

    /// Delete every entry up to and including `up_to_index`.
    pub fn compact_log(&self, up_to_index: LogIndex) -> Result<()> {
        self.delete_log_range(0, Some(up_to_index))
    }

    pub fn save_snapshot(&self, data: &[u8], meta: SnapshotMeta) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(SNAPSHOT_KEY, data);
        batch.put(SNAPSHOT_META_KEY, bincode::serialize(&meta)?);
        self.db.write(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<(Vec<u8>, SnapshotMeta)>> {
        let meta = match self.db.get(SNAPSHOT_META_KEY)? {
            Some(d) => bincode::deserialize::<SnapshotMeta>(&d)?,
            None => return Ok(None),
        };
        match self.db.get(SNAPSHOT_KEY)? {
            Some(data) => Ok(Some((data, meta))),
            None => Err(BlockFsError::Storage(
                "snapshot metadata present without snapshot data".into(),
            )),
        }
    }

    fn delete_log_range(&self, from: LogIndex, through: Option<LogIndex>) -> Result<()> {
        let start = log_key(from);
        let mut batch = WriteBatch::default();

        for item in self.db.iterator(IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            if let Some(through) = through {
                if parse_log_key(&key)? > through {
                    break;
                }
            }
            batch.delete(&key);
        }

        self.db.write(batch)?;
        Ok(())
    }
}

fn log_key(index: LogIndex) -> Vec<u8> {
    let mut key = LOG_PREFIX.to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn parse_log_key(key: &[u8]) -> Result<LogIndex> {
    let bytes: [u8; 8] = key
        .get(LOG_PREFIX.len()..)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| BlockFsError::Storage("invalid log key".into()))?;
    Ok(LogIndex::from_be_bytes(bytes))
}
