//! Command-line interface for blockfs.

use crate::types::FileInfo;
use clap::{Parser, Subcommand};
use std::fmt::Write;
use std::path::PathBuf;

/// blockfs - a replicated block file store.
#[derive(Parser)]
#[command(name = "blockfs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "BLOCKFS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "BLOCKFS_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Metadata service addresses, comma separated
    #[arg(
        short,
        long,
        env = "BLOCKFS_METADATA",
        value_delimiter = ',',
        global = true
    )]
    pub metadata: Vec<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a metadata replica
    Metadata {
        /// Replica ID
        #[arg(long, env = "BLOCKFS_NODE_ID")]
        id: Option<u64>,

        /// Bind address for the metadata API and Raft
        #[arg(long)]
        bind: Option<String>,

        /// Raft peer addresses, this replica included (format: id=addr,id=addr)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Block size in bytes
        #[arg(long)]
        block_size: Option<u64>,

        /// Replicas per block
        #[arg(long)]
        replica_factor: Option<usize>,
    },

    /// Run a chunk server
    Chunk {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Address to register with the metadata service
        #[arg(long)]
        advertise: Option<String>,

        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Upload a local file
    Put { local: PathBuf, remote: String },

    /// Download a file
    Get { remote: String, local: PathBuf },

    /// Delete a file
    Delete { remote: String },

    /// Create a directory (path ends with /)
    Mkdir { remote: String },

    /// Rename a file
    Rename { old: String, new: String },

    /// List a directory and everything below it
    List { remote: String },

    /// Show a file's size
    Stat { remote: String },
}

impl Commands {
    /// Whether this command runs a long-lived server.
    pub fn is_server(&self) -> bool {
        matches!(self, Commands::Metadata { .. } | Commands::Chunk { .. })
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Render listings as an aligned `name  size (bytes)` table sorted by name.
pub fn format_file_infos(infos: &[FileInfo]) -> String {
    let mut sorted: Vec<&FileInfo> = infos.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let header = "name";
    let width = sorted
        .iter()
        .map(|info| info.name.len())
        .max()
        .unwrap_or(0)
        .max(header.len());

    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  size (bytes)", header, width = width);
    for info in sorted {
        let _ = writeln!(out, "{:<width$}  {}", info.name, info.size, width = width);
    }
    out
}
