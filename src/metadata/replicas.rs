//! Replica directory: registered chunk servers and where each block lives.

use crate::types::{BlockId, Loc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A registered chunk server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkServerInfo {
    pub addr: String,
    /// Last block count reported by a heartbeat.
    pub block_count: u64,
}

/// Loc → whether that replica holds a confirmed copy.
pub type ReplicaSet = BTreeMap<Loc, bool>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDirectory {
    servers: BTreeMap<Loc, ChunkServerInfo>,
    next_loc: Loc,
    blocks: BTreeMap<BlockId, ReplicaSet>,
}

impl ReplicaDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loc the next registration will receive.
    pub fn next_loc(&self) -> Loc {
        self.next_loc
    }

    pub fn servers(&self) -> impl Iterator<Item = (Loc, &ChunkServerInfo)> {
        self.servers.iter().map(|(loc, info)| (*loc, info))
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn addr_of(&self, loc: Loc) -> Option<&str> {
        self.servers.get(&loc).map(|s| s.addr.as_str())
    }

    pub fn loc_of(&self, addr: &str) -> Option<Loc> {
        self.servers
            .iter()
            .find(|(_, info)| info.addr == addr)
            .map(|(loc, _)| *loc)
    }

    /// Give `addr` the next loc. Locs are never handed out twice.
    pub fn register(&mut self, addr: String) -> Loc {
        let loc = self.next_loc;
        self.servers.insert(
            loc,
            ChunkServerInfo {
                addr,
                block_count: 0,
            },
        );
        self.next_loc += 1;
        loc
    }

    pub fn deregister(&mut self, loc: Loc) -> Option<ChunkServerInfo> {
        self.servers.remove(&loc)
    }

    pub fn set_block_count(&mut self, loc: Loc, block_count: u64) {
        if let Some(server) = self.servers.get_mut(&loc) {
            server.block_count = block_count;
        }
    }

    pub fn replicas(&self, block: &BlockId) -> Option<&ReplicaSet> {
        self.blocks.get(block)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Reserve `locs` for a new block; no replica is valid yet.
    pub fn insert_block(&mut self, block: BlockId, locs: &[Loc]) {
        self.blocks
            .insert(block, locs.iter().map(|&loc| (loc, false)).collect());
    }

    pub fn remove_block(&mut self, block: &BlockId) -> Option<ReplicaSet> {
        self.blocks.remove(block)
    }

    /// Set one replica's flag. Returns false if `loc` is not part of the set.
    pub fn set_validity(&mut self, block: &BlockId, loc: Loc, valid: bool) -> bool {
        match self.blocks.get_mut(block).and_then(|set| set.get_mut(&loc)) {
            Some(flag) => {
                *flag = valid;
                true
            }
            None => false,
        }
    }

    /// Swap `from` for `to` in a block's replica set, marking `to` valid.
    pub fn replace_replica(&mut self, block: &BlockId, from: Loc, to: Loc) -> bool {
        let Some(set) = self.blocks.get_mut(block) else {
            return false;
        };
        if set.remove(&from).is_none() {
            return false;
        }
        set.insert(to, true);
        true
    }

    /// Blocks holding a valid replica on `loc`.
    pub fn blocks_valid_on(&self, loc: Loc) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|(_, set)| set.get(&loc).copied().unwrap_or(false))
            .map(|(block, _)| *block)
            .collect()
    }

    pub fn has_valid_replica(&self, block: &BlockId) -> bool {
        self.blocks
            .get(block)
            .is_some_and(|set| set.values().any(|&valid| valid))
    }

    /// Addresses of the replicas whose flag equals `valid`, in loc order.
    pub fn addrs_with_validity(&self, block: &BlockId, valid: bool) -> Vec<String> {
        let Some(set) = self.blocks.get(block) else {
            return Vec::new();
        };
        set.iter()
            .filter(|(_, &flag)| flag == valid)
            .filter_map(|(loc, _)| self.addr_of(*loc).map(str::to_string))
            .collect()
    }
}
