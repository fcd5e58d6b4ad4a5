//! In-memory view of the replicated log.

use crate::error::{BlockFsError, Result};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// A single entry in the Raft log.
///
/// Payloads are whole metadata snapshots, so they sit behind an `Arc` and are
/// shared between the log, storage batches and outgoing AppendEntries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            data: Arc::new(data),
        }
    }

    /// Empty entry a new leader appends to commit earlier terms.
    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self::new(term, index, Vec::new())
    }

    pub fn is_noop(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }
}

mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// Entries after the last snapshot, plus the position the snapshot covers.
#[derive(Debug)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry.
    first_index: LogIndex,
    /// Term of the entry at `first_index - 1`.
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_term: 0,
        }
    }

    pub fn last_index(&self) -> LogIndex {
        self.first_index + self.entries.len() as u64 - 1
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Index covered by the last snapshot (0 if none).
    pub fn snapshot_index(&self) -> LogIndex {
        self.first_index - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(BlockFsError::RaftLog(format!(
                "expected index {}, got {}",
                expected, entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// Term at `index`, including the snapshot boundary.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index() {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// At most `limit` entries starting at `start`.
    pub fn entries_from_limit(&self, start: LogIndex, limit: usize) -> Vec<LogEntry> {
        if start > self.last_index() {
            return Vec::new();
        }
        let offset = (start.max(self.first_index) - self.first_index) as usize;
        self.entries.iter().skip(offset).take(limit).cloned().collect()
    }

    /// Entries in `[start, end]`.
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        if end < start {
            return Vec::new();
        }
        self.entries_from_limit(start, (end - start + 1) as usize)
    }

    /// Drop `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.first_index) as usize);
    }

    /// AppendEntries consistency check.
    pub fn matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        self.term_at(prev_log_index) == Some(prev_log_term)
    }

    /// Forget entries up to and including `up_to_index`.
    pub fn compact(&mut self, up_to_index: LogIndex, snapshot_term: Term) {
        if up_to_index < self.first_index {
            return;
        }
        let drop = ((up_to_index - self.first_index + 1) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.first_index = up_to_index + 1;
        self.snapshot_term = snapshot_term;
    }

    /// Election restriction: is the candidate's log at least as up-to-date as ours.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_term = self.last_term();
        if last_log_term != our_term {
            last_log_term > our_term
        } else {
            last_log_index >= self.last_index()
        }
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[Term]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(LogEntry::new(*term, i as u64 + 1, vec![i as u8]))
                .unwrap();
        }
        log
    }

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert!(log.matches(0, 0));
    }

    #[test]
    fn test_append_rejects_gaps() {
        let mut log = log_with_terms(&[1, 1]);
        assert!(log.append(LogEntry::new(1, 4, vec![])).is_err());
        assert!(log.append(LogEntry::new(2, 3, vec![])).is_ok());
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn test_entries_from_limit() {
        let log = log_with_terms(&[1, 1, 2, 2, 3]);
        let batch = log.entries_from_limit(2, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, 2);
        assert_eq!(batch[1].index, 3);
        assert!(log.entries_from_limit(6, 10).is_empty());
        assert_eq!(log.entries_range(4, 5).len(), 2);
    }

    #[test]
    fn test_truncate_and_matches() {
        let mut log = log_with_terms(&[1, 2, 2]);
        assert!(log.matches(2, 2));
        assert!(!log.matches(2, 1));
        assert!(!log.matches(4, 2));

        log.truncate_from(2);
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_compact_keeps_boundary_term() {
        let mut log = log_with_terms(&[1, 1, 2, 2]);
        log.compact(2, 1);

        assert_eq!(log.first_index(), 3);
        assert_eq!(log.snapshot_index(), 2);
        assert!(log.get(2).is_none());
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.get(3).unwrap().data_bytes(), &[2]);

        // Compacting past the end leaves an empty log positioned after the snapshot.
        log.compact(10, 4);
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 4);
    }

    #[test]
    fn test_is_up_to_date() {
        let log = log_with_terms(&[1, 2]);
        assert!(log.is_up_to_date(1, 3));
        assert!(log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(1, 2));
        assert!(!log.is_up_to_date(5, 1));
    }

    #[test]
    fn test_noop_entry() {
        let entry = LogEntry::noop(3, 7);
        assert!(entry.is_noop());
        assert!(!LogEntry::new(3, 8, vec![1]).is_noop());
    }
}
