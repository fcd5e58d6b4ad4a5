//! Placement engine for choosing which chunk servers hold a block.

use crate::error::{BlockFsError, Result};
use crate::types::{BlockId, Loc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Placement strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Uniformly random distinct servers.
    #[default]
    Random,
    /// Servers holding the fewest blocks first; ties broken randomly.
    LeastLoaded,
}

/// A server that may receive a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub loc: Loc,
    /// Blocks last reported by the server's heartbeat.
    pub block_count: u64,
}

/// Chooses replica locations and mints block IDs from one random source.
///
/// Seeding the engine makes placement and block IDs reproducible.
#[derive(Debug)]
pub struct PlacementEngine {
    strategy: PlacementStrategy,
    rng: Mutex<StdRng>,
}

impl PlacementEngine {
    pub fn new(strategy: PlacementStrategy) -> Self {
        Self {
            strategy,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(strategy: PlacementStrategy, seed: u64) -> Self {
        Self {
            strategy,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn strategy(&self) -> PlacementStrategy {
        self.strategy
    }

    /// Pick `count` distinct locs from `candidates`.
    pub fn choose(&self, candidates: &[Candidate], count: usize) -> Result<Vec<Loc>> {
        if candidates.len() < count {
            return Err(BlockFsError::InsufficientReplicas {
                need: count,
                have: candidates.len(),
            });
        }

        let mut pool = candidates.to_vec();
        pool.shuffle(&mut *self.rng.lock());
        if self.strategy == PlacementStrategy::LeastLoaded {
            // Stable, so the shuffle still breaks ties.
            pool.sort_by_key(|c| c.block_count);
        }

        Ok(pool.into_iter().take(count).map(|c| c.loc).collect())
    }

    /// Pick a single migration destination.
    pub fn choose_one(&self, candidates: &[Candidate]) -> Result<Loc> {
        self.choose(candidates, 1)?
            .into_iter()
            .next()
            .ok_or(BlockFsError::InsufficientReplicas { need: 1, have: 0 })
    }

    /// Fresh block identifier drawn from the engine's random source.
    pub fn new_block_id(&self) -> BlockId {
        BlockId::from_rng(&mut *self.rng.lock())
    }
}

impl Default for PlacementEngine {
    fn default() -> Self {
        Self::new(PlacementStrategy::Random)
    }
}
