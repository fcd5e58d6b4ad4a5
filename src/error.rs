//! Error types for the blockfs file store.
//!
//! This module provides a unified error type [`BlockFsError`] for all blockfs operations,
//! along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **File store**: the kinds callers act on (`NotLeader`, `NotFound`, `AlreadyExists`,
//!   `InsufficientReplicas`, `Unreachable`, `DataCorrupted`, `InvalidOperation`)
//! - **Raft Consensus**: log and election failures inside the metadata service
//! - **Storage**: RocksDB, chunk files and serialization
//! - **Configuration**: invalid settings or missing configuration
//!
//! Errors cross the HTTP boundary as an [`ErrorResponse`] envelope; the `code` field
//! lets clients rebuild the typed variant with [`BlockFsError::from_wire`].
//!
//! # Example
//!
//! ```rust
//! use blockfs::error::{BlockFsError, Result};
//!
//! fn open(path: &str) -> Result<()> {
//!     if path.ends_with('/') {
//!         return Err(BlockFsError::InvalidOperation(format!("{} is a directory", path)));
//!     }
//!     Ok(())
//! }
//!
//! let err = open("/doc/").unwrap_err();
//! assert!(!err.is_retryable());
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Main error type for blockfs operations.
#[derive(Error, Debug)]
pub enum BlockFsError {
    // File store errors
    #[error("Not the leader. Leader is: {leader:?}")]
    NotLeader { leader: Option<u64> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Insufficient chunk servers: have {have}, need {need}")]
    InsufficientReplicas { need: usize, have: usize },

    #[error("Unreachable: {0}")]
    Unreachable(String),

    #[error("Data corrupted: {0}")]
    DataCorrupted(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    // Raft consensus errors
    #[error("Raft log error: {0}")]
    RaftLog(String),

    #[error("Node not found: {0}")]
    NodeNotFound(u64),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // Network errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlockFsError {
    /// Check if error is retryable against another metadata replica or after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BlockFsError::NotLeader { .. }
                | BlockFsError::Unreachable(_)
                | BlockFsError::Timeout(_)
                | BlockFsError::Network(_)
        )
    }

    /// Stable wire code carried in [`ErrorResponse::code`].
    pub fn code(&self) -> &'static str {
        match self {
            BlockFsError::NotLeader { .. } => "not_leader",
            BlockFsError::NotFound(_) => "not_found",
            BlockFsError::AlreadyExists(_) => "already_exists",
            BlockFsError::InsufficientReplicas { .. } => "insufficient_replicas",
            BlockFsError::Unreachable(_) => "unreachable",
            BlockFsError::DataCorrupted(_) | BlockFsError::ChecksumMismatch { .. } => {
                "data_corrupted"
            }
            BlockFsError::InvalidOperation(_) => "invalid_operation",
            BlockFsError::Timeout(_) => "timeout",
            _ => "internal",
        }
    }

    /// HTTP status used when the error leaves a server handler.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BlockFsError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            BlockFsError::NotFound(_) => StatusCode::NOT_FOUND,
            BlockFsError::AlreadyExists(_) => StatusCode::CONFLICT,
            BlockFsError::InsufficientReplicas { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BlockFsError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            BlockFsError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rebuild a typed error from a server's error envelope.
    pub fn from_wire(response: ErrorResponse) -> Self {
        let ErrorResponse {
            code,
            message,
            leader,
            need,
            have,
        } = response;
        match code.as_str() {
            "not_leader" => BlockFsError::NotLeader { leader },
            "not_found" => BlockFsError::NotFound(message),
            "already_exists" => BlockFsError::AlreadyExists(message),
            "insufficient_replicas" => BlockFsError::InsufficientReplicas {
                need: need.unwrap_or_default(),
                have: have.unwrap_or_default(),
            },
            "unreachable" => BlockFsError::Unreachable(message),
            "data_corrupted" => BlockFsError::DataCorrupted(message),
            "invalid_operation" => BlockFsError::InvalidOperation(message),
            "timeout" => BlockFsError::Timeout(message),
            _ => BlockFsError::Internal(message),
        }
    }
}

/// JSON error body returned by every HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub need: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub have: Option<usize>,
}

impl From<&BlockFsError> for ErrorResponse {
    fn from(err: &BlockFsError) -> Self {
        let (leader, need, have) = match err {
            BlockFsError::NotLeader { leader } => (*leader, None, None),
            BlockFsError::InsufficientReplicas { need, have } => (None, Some(*need), Some(*have)),
            _ => (None, None, None),
        };
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            leader,
            need,
            have,
        }
    }
}

impl IntoResponse for BlockFsError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorResponse::from(&self))).into_response()
    }
}

impl From<rocksdb::Error> for BlockFsError {
    fn from(e: rocksdb::Error) -> Self {
        BlockFsError::RocksDb(e.to_string())
    }
}

impl From<bincode::Error> for BlockFsError {
    fn from(e: bincode::Error) -> Self {
        BlockFsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for BlockFsError {
    fn from(e: serde_json::Error) -> Self {
        BlockFsError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for BlockFsError {
    fn from(e: reqwest::Error) -> Self {
        // Only a failed connect proves the request never reached the peer.
        if e.is_connect() {
            BlockFsError::Unreachable(e.to_string())
        } else if e.is_timeout() {
            BlockFsError::Timeout(e.to_string())
        } else if e.is_decode() {
            BlockFsError::Deserialization(e.to_string())
        } else {
            BlockFsError::Network(e.to_string())
        }
    }
}

/// Result type alias for blockfs operations.
pub type Result<T> = std::result::Result<T, BlockFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(BlockFsError::NotLeader { leader: Some(2) }.is_retryable());
        assert!(BlockFsError::Unreachable("127.0.0.1:9000".into()).is_retryable());
        assert!(!BlockFsError::NotFound("/a".into()).is_retryable());
        assert!(!BlockFsError::DataCorrupted("block".into()).is_retryable());
    }

    #[test]
    fn test_wire_roundtrip_keeps_kind() {
        let err = BlockFsError::InsufficientReplicas { need: 3, have: 1 };
        let wire = ErrorResponse::from(&err);
        assert_eq!(wire.code, "insufficient_replicas");

        match BlockFsError::from_wire(wire) {
            BlockFsError::InsufficientReplicas { need, have } => {
                assert_eq!(need, 3);
                assert_eq!(have, 1);
            }
            other => panic!("unexpected error: {}", other),
        }

        let wire = ErrorResponse::from(&BlockFsError::NotLeader { leader: Some(3) });
        assert!(matches!(
            BlockFsError::from_wire(wire),
            BlockFsError::NotLeader { leader: Some(3) }
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            BlockFsError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BlockFsError::AlreadyExists("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            BlockFsError::NotLeader { leader: None }.status_code(),
            StatusCode::MISDIRECTED_REQUEST
        );
    }

    #[test]
    fn test_checksum_mismatch_reports_as_corruption() {
        let err = BlockFsError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        };
        assert_eq!(err.code(), "data_corrupted");
    }
}
