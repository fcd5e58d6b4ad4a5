//! Chunk servers: local block storage behind an HTTP surface.
//!
//! Each server stores whole blocks keyed by [`BlockId`](crate::types::BlockId),
//! registers itself with the metadata leader at startup and answers the leader's
//! heartbeats with its block count.

mod server;
mod store;

pub use server::{
    start_chunk_server, start_chunk_server_with_listener, ChunkServer, ChunkServerHandle,
};
pub use store::{ChunkStore, StoredBlock};
