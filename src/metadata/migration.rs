//! Background upkeep of the metadata service.
//!
//! The leader probes every chunk server on a fixed period. A server that misses a
//! heartbeat has each of its valid replicas copied to another server, then is
//! dropped from the directory. Followers periodically pull the applied image so
//! their read-only answers stay reasonably fresh.

use super::service::{MetadataService, ServiceState};
use super::state::MetadataState;
use crate::cluster::placement::Candidate;
use crate::error::{BlockFsError, Result};
use crate::observability;
use crate::types::{BlockId, Loc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of moving replicas off a chunk server.
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Replicas copied and swapped into their replica sets.
    pub moved: usize,
    /// Why migration stopped early, if it did.
    pub failure: Option<BlockFsError>,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

impl MetadataService {
    /// Probe chunk servers every `period` while this replica leads.
    pub async fn run_heartbeat_loop(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(node_id = self.node_id(), ?period, "Heartbeat loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.heartbeat_round().await {
                        Ok(()) | Err(BlockFsError::NotLeader { .. }) => {}
                        Err(e) => warn!(node_id = self.node_id(), error = %e, "Heartbeat round failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!(node_id = self.node_id(), "Heartbeat loop stopping");
                    break;
                }
            }
        }
    }

    /// One pass over every registered chunk server.
    pub async fn heartbeat_round(&self) -> Result<()> {
        let mut inner = self.lock_leader().await?;
        let servers: Vec<(Loc, String)> = inner
            .state
            .replicas
            .servers()
            .map(|(loc, info)| (loc, info.addr.clone()))
            .collect();

        let mut changed = false;
        for (loc, addr) in servers {
            match self.chunks.heartbeat(&addr).await {
                Ok(block_count) => {
                    let known = inner
                        .state
                        .replicas
                        .servers()
                        .find(|(l, _)| *l == loc)
                        .map(|(_, info)| info.block_count);
                    if known != Some(block_count) {
                        inner.state.replicas.set_block_count(loc, block_count);
                        changed = true;
                    }
                }
                Err(e) => {
                    warn!(addr = %addr, loc, error = %e, "Chunk server missed heartbeat");
                    observability::record_heartbeat_failure();
                    let report = self.remove_chunk_server(&mut inner, loc).await;
                    changed |= report.moved > 0 || report.is_complete();
                    if let Some(e) = report.failure {
                        warn!(addr = %addr, loc, error = %e, "Keeping unreachable chunk server");
                    }
                }
            }
        }

        if changed {
            self.commit(&mut inner).await?;
        }
        Ok(())
    }

    /// Migrate `loc`'s replicas and deregister it once nothing depends on it.
    pub(super) async fn remove_chunk_server(
        &self,
        inner: &mut ServiceState,
        loc: Loc,
    ) -> MigrationReport {
        let report = self.data_migration(inner, loc).await;
        if report.is_complete() {
            if let Some(info) = inner.state.replicas.deregister(loc) {
                info!(addr = %info.addr, loc, moved = report.moved, "Removed chunk server");
                observability::record_chunk_server_removed();
            }
        }
        report
    }

    async fn data_migration(&self, inner: &mut ServiceState, loc: Loc) -> MigrationReport {
        let blocks = inner.state.replicas.blocks_valid_on(loc);
        info!(loc, blocks = blocks.len(), "Starting data migration");

        let mut report = MigrationReport::default();
        for block_id in blocks {
            match self.migrate_block(inner, block_id, loc).await {
                Ok(to) => {
                    report.moved += 1;
                    observability::record_block_migrated();
                    debug!(block_id = %block_id, from = loc, to, "Migrated replica");
                }
                Err(e) => {
                    warn!(block_id = %block_id, loc, error = %e, "Unable to migrate replica");
                    report.failure = Some(e);
                    break;
                }
            }
        }
        report
    }

    /// Copy one replica from a healthy holder to a server outside the set.
    async fn migrate_block(
        &self,
        inner: &mut ServiceState,
        block_id: BlockId,
        loc: Loc,
    ) -> Result<Loc> {
        let set = inner
            .state
            .replicas
            .replicas(&block_id)
            .cloned()
            .ok_or_else(|| BlockFsError::NotFound(format!("block {}", block_id)))?;

        let candidates: Vec<Candidate> = inner
            .candidates()
            .into_iter()
            .filter(|c| !set.contains_key(&c.loc))
            .collect();
        let to = self.placement.choose_one(&candidates)?;
        let to_addr = inner
            .address_of(to)
            .ok_or_else(|| BlockFsError::NotFound(format!("chunk server {}", to)))?;

        let sources: Vec<String> = set
            .iter()
            .filter(|(l, valid)| **valid && **l != loc)
            .filter_map(|(l, _)| inner.state.replicas.addr_of(*l).map(str::to_string))
            .collect();
        if sources.is_empty() {
            return Err(BlockFsError::Unreachable(format!(
                "no other valid replica of block {}",
                block_id
            )));
        }

        let mut last_error = None;
        let mut data = None;
        for addr in &sources {
            match self.chunks.read(addr, block_id).await {
                Ok(bytes) => {
                    data = Some(bytes);
                    break;
                }
                Err(e) => {
                    debug!(addr = %addr, block_id = %block_id, error = %e, "Migration source failed");
                    last_error = Some(e);
                }
            }
        }
        let data = match (data, last_error) {
            (Some(data), _) => data,
            (None, Some(e)) => return Err(e),
            (None, None) => return Err(BlockFsError::Internal("no migration source".into())),
        };

        self.chunks.write(&to_addr, block_id, data).await?;
        inner.state.replicas.replace_replica(&block_id, loc, to);
        Ok(to)
    }

    /// Refresh a follower's read copy every `period`.
    pub async fn run_sync_read_loop(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_read().await {
                        debug!(node_id = self.node_id(), error = %e, "Sync read failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Replace the working copy with the applied image. A no-op on the leader.
    pub async fn sync_read(&self) -> Result<()> {
        if self.raft.is_leader().await {
            return Ok(());
        }
        let (index, data) = self.raft.read_state().await?;
        let state = MetadataState::decode(&data)?;

        let mut inner = self.inner.lock().await;
        inner.state = state;
        inner.adopted_term = None;
        debug!(node_id = self.node_id(), index, "Synced read copy");
        Ok(())
    }
}
