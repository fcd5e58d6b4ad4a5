//! Raft state machine plugin for the metadata image.
//!
//! Every command is a complete encoded [`MetadataState`]; applying one replaces
//! the current image wholesale, so replaying an entry is harmless.

use super::state::MetadataState;
use crate::error::Result;
use crate::raft::StateMachine;
use crate::types::LogIndex;
use tracing::{debug, error};

#[derive(Debug, Default)]
pub struct MetadataStateMachine {
    state: MetadataState,
    last_applied: LogIndex,
}

impl MetadataStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &MetadataState {
        &self.state
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }
}

impl StateMachine for MetadataStateMachine {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<()> {
        let state = MetadataState::decode(command).map_err(|e| {
            error!(index, error = %e, "Failed to decode proposed metadata state");
            e
        })?;
        self.state = state;
        self.last_applied = index;
        debug!(
            index,
            files = self.state.namespace.len(),
            blocks = self.state.replicas.block_count(),
            "Applied metadata state"
        );
        Ok(())
    }

    fn snapshot(&self) -> Vec<u8> {
        self.state.encode().unwrap_or_else(|e| {
            error!(error = %e, "Failed to encode metadata snapshot");
            Vec::new()
        })
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        self.state = MetadataState::decode(snapshot)?;
        Ok(())
    }
}
