//! Cluster-wide policy for blockfs.
//!
//! Currently this is replica placement: which chunk servers receive a new block,
//! and which one takes over a replica during migration.

pub mod placement;

pub use placement::{Candidate, PlacementEngine, PlacementStrategy};
