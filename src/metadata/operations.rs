//! Request and response bodies of the metadata RPC surface.

use crate::types::{BlockId, FetchOp, FileInfo, Loc, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub block_size: u64,
    pub loc: Loc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResponse {
    pub block_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenResponse {
    pub block_size: u64,
    pub block_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchBlockAddrsRequest {
    pub path: String,
    pub index: u64,
    pub op: FetchOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchBlockAddrsResponse {
    pub addrs: Vec<String>,
    pub block_id: Option<BlockId>,
}

/// Per-address outcome of a client write or remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocsValidityNotifyRequest {
    pub block_id: BlockId,
    pub validity: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRequest {
    pub old_path: String,
    pub new_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchFileInfoRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchFileInfoResponse {
    pub infos: Vec<FileInfo>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IsLeaderResponse {
    pub is_leader: bool,
    pub leader: Option<NodeId>,
}

/// Empty acknowledgement.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Ack {}
