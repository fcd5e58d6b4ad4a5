//! blockfs CLI - Main entry point.

use anyhow::Context;
use blockfs::cli::{format_file_infos, Cli, Commands};
use blockfs::client::Client;
use blockfs::config::{BlockFsConfig, NodeRole};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => BlockFsConfig::from_file(path)?,
        None => BlockFsConfig::default(),
    };
    if !cli.metadata.is_empty() {
        config.chunk.metadata_addrs = cli.metadata.clone();
        config.client.metadata_addrs = cli.metadata.clone();
    }
    config.observability.log_level = match (&cli.log_level, cli.command.is_server()) {
        (Some(level), _) => level.clone(),
        (None, true) => config.observability.log_level.clone(),
        (None, false) => "warn".to_string(),
    };
    blockfs::observability::init(&config.observability)?;

    if cli.command.is_server() {
        apply_server_flags(&mut config, cli.command)?;
        blockfs::run(config).await?;
        return Ok(());
    }

    let client = Client::new(&config.client);
    match cli.command {
        Commands::Put { local, remote } => client.put(&local, &remote).await?,
        Commands::Get { remote, local } => client.get(&remote, &local).await?,
        Commands::Delete { remote } => client.remove(&remote).await?,
        Commands::Mkdir { remote } => client.mkdir(&remote).await?,
        Commands::Rename { old, new } => client.rename(&old, &new).await?,
        Commands::List { remote } => print!("{}", format_file_infos(&client.list(&remote).await?)),
        Commands::Stat { remote } => print!("{}", format_file_infos(&[client.stat(&remote).await?])),
        Commands::Metadata { .. } | Commands::Chunk { .. } => {}
    }

    Ok(())
}

/// Overlay server subcommand flags on the loaded configuration.
fn apply_server_flags(config: &mut BlockFsConfig, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Metadata {
            id,
            bind,
            peers,
            data_dir,
            block_size,
            replica_factor,
        } => {
            config.node.role = NodeRole::Metadata;
            if let Some(id) = id {
                config.node.id = id;
            }
            if let Some(bind) = bind {
                config.metadata.bind_addr = bind.parse().context("invalid --bind address")?;
            }
            if !peers.is_empty() {
                config.metadata.raft_peers = peers;
            }
            if let Some(data_dir) = data_dir {
                config.node.data_dir = data_dir;
            }
            if let Some(block_size) = block_size {
                config.metadata.block_size = block_size;
            }
            if let Some(replica_factor) = replica_factor {
                config.metadata.replica_factor = replica_factor;
            }
        }
        Commands::Chunk {
            bind,
            advertise,
            data_dir,
        } => {
            config.node.role = NodeRole::Chunk;
            if let Some(bind) = bind {
                config.chunk.bind_addr = bind.parse().context("invalid --bind address")?;
            }
            if advertise.is_some() {
                config.chunk.advertise_addr = advertise;
            }
            if let Some(data_dir) = data_dir {
                config.node.data_dir = data_dir;
            }
        }
        _ => {}
    }
    Ok(())
}
