//! blockfs - a replicated block file store.
//!
//! Files are split into fixed-size blocks stored on chunk servers with full-copy
//! replication. A Raft-replicated metadata service owns the namespace and knows
//! which chunk servers hold each block; clients move bytes to and from chunk
//! servers directly and report back which replicas they wrote.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Client: Put | Get | Remove | Stat | List | Mkdir | Rename   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Metadata Service: Raft | Namespace | Replica Directory      │
//! │                    Heartbeats | Migration                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Chunk Servers: Block Store | Checksums | Caching            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use blockfs::config::BlockFsConfig;
//!
//! #[tokio::main]
//! async fn main() -> blockfs::Result<()> {
//!     // Single metadata replica on localhost
//!     let config = BlockFsConfig::development();
//!     blockfs::run(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod chunk;
pub mod cli;
pub mod client;
pub mod cluster;
pub mod metadata;
pub mod observability;
pub mod raft;
pub mod shutdown;

// Re-exports
pub use error::{BlockFsError, Result};
pub use types::*;

use config::{BlockFsConfig, NodeRole};
use metadata::MetadataServer;
use shutdown::{ServiceHandle, ShutdownCoordinator, ShutdownManager, SignalHandler};
use tracing::{error, info};

/// Run a metadata replica or chunk server until SIGINT/SIGTERM.
///
/// Logging must already be initialized, see [`observability::init`].
pub async fn run(config: BlockFsConfig) -> Result<()> {
    config.validate()?;
    info!(id = config.node.id, role = ?config.node.role, "Starting blockfs node");

    std::fs::create_dir_all(&config.node.data_dir)?;

    let coordinator = ShutdownCoordinator::new();
    let mut shutdown_manager = ShutdownManager::new(coordinator.clone());

    match config.node.role {
        NodeRole::Metadata => {
            let server = MetadataServer::start(
                config.node.id,
                &config.metadata,
                &config.node.data_dir,
                &coordinator,
            )
            .await?;
            shutdown_manager.register(ServiceHandle::new("metadata", server.stop()));
        }
        NodeRole::Chunk => {
            let handle = chunk::start_chunk_server(
                &config.chunk,
                &config.client,
                &config.node.data_dir,
                &coordinator,
            )
            .await?;
            shutdown_manager.register(ServiceHandle::new("chunk", handle.stop()));
        }
    }

    if config.observability.metrics_enabled {
        info!(addr = %config.observability.metrics_addr, "Starting metrics server");
        let metrics = tokio::spawn(observability::run_metrics_server(
            config.observability.clone(),
            coordinator.subscribe(),
        ));
        shutdown_manager.register(ServiceHandle::new("metrics", async move {
            match metrics.await {
                Ok(Err(e)) => error!(error = %e, "Metrics server error"),
                Err(e) => error!(error = %e, "Metrics server panicked"),
                Ok(Ok(())) => {}
            }
        }));
    }

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        SignalHandler::new(signal_coordinator).run().await;
    });

    coordinator.wait_for_shutdown().await;
    info!("Shutting down blockfs gracefully...");
    shutdown_manager.run().await;

    info!("blockfs shutdown complete");
    Ok(())
}
