//! Observability for blockfs.
//!
//! Provides logging and Prometheus metrics.

use crate::config::ObservabilityConfig;
use crate::error::{BlockFsError, Result};
use ::tracing::info;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging to stderr.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| BlockFsError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| BlockFsError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Serve `/metrics` until `shutdown` fires.
pub async fn run_metrics_server(
    config: ObservabilityConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| BlockFsError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| BlockFsError::Network(e.to_string()))?;

    Ok(())
}

/// Register standard metrics.
fn register_metrics() {
    // Raft metrics
    gauge!("blockfs_raft_term").set(0.0);
    gauge!("blockfs_raft_commit_index").set(0.0);

    // Metadata metrics
    gauge!("blockfs_chunk_servers").set(0.0);
    gauge!("blockfs_paths_total").set(0.0);
    gauge!("blockfs_blocks_total").set(0.0);
    counter!("blockfs_metadata_ops_total").absolute(0);
    counter!("blockfs_heartbeat_failures_total").absolute(0);
    counter!("blockfs_chunk_servers_removed_total").absolute(0);
    counter!("blockfs_blocks_migrated_total").absolute(0);

    // Chunk server metrics
    counter!("blockfs_chunk_bytes_total").absolute(0);
}

/// Record a committed (or refused) metadata mutation.
pub fn record_metadata_op(op: &str, success: bool) {
    counter!(
        "blockfs_metadata_ops_total",
        "op" => op.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

pub fn record_heartbeat_failure() {
    counter!("blockfs_heartbeat_failures_total").increment(1);
}

pub fn record_chunk_server_removed() {
    counter!("blockfs_chunk_servers_removed_total").increment(1);
}

pub fn record_block_migrated() {
    counter!("blockfs_blocks_migrated_total").increment(1);
}

/// Record bytes moved by a chunk server; `direction` is `read` or `write`.
pub fn record_chunk_bytes(direction: &'static str, bytes: usize) {
    counter!("blockfs_chunk_bytes_total", "direction" => direction).increment(bytes as u64);
}

/// Update metadata size gauges after a commit.
pub fn update_metadata_gauges(chunk_servers: usize, paths: usize, blocks: usize) {
    gauge!("blockfs_chunk_servers").set(chunk_servers as f64);
    gauge!("blockfs_paths_total").set(paths as f64);
    gauge!("blockfs_blocks_total").set(blocks as f64);
}

/// Update Raft metrics.
pub fn update_raft_metrics(term: u64, commit_index: u64) {
    gauge!("blockfs_raft_term").set(term as f64);
    gauge!("blockfs_raft_commit_index").set(commit_index as f64);
}
