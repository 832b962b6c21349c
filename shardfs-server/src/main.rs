use clap::{Parser, Subcommand};
use shardfs::placement::ShardId;
use shardfs_server_lib::config::ShardfsConfig;
use shardfs_server_lib::{serve, wait_for_shutdown};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Servers of the shardfs sharded file store.
///
/// The configuration is read from the TOML file named by `SHARDFS_CONFIG_FILE` (default
/// `/etc/shardfs/config.toml`) and from `SHARDFS_*` environment variables.
#[derive(Parser)]
#[command(version)]
struct ServerOpts {
    /// Server to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator, which accepts client connections and stores `.c` files itself.
    Coordinator,

    /// Run a storage node.
    Node {
        /// Shard served by the node: S2 (`.pdf`), S3 (`.txt`) or S4 (`.zip`).
        shard: ShardId,
    },

    /// Run the coordinator and all storage nodes in a single process.
    All,
}

impl Commands {
    fn shards(&self) -> Result<Vec<ShardId>, String> {
        match self {
            Commands::Coordinator => Ok(vec![ShardId::S1]),
            Commands::Node { shard } if shard.is_local() => Err(format!(
                "{shard} is served by the coordinator, not by a storage node"
            )),
            Commands::Node { shard } => Ok(vec![*shard]),
            Commands::All => Ok(ShardId::ALL.to_vec()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = ServerOpts::parse();
    let shards = opts.command.shards()?;
    let config = Arc::new(ShardfsConfig::load()?);
    tracing_subscriber::fmt()
        .with_max_level(config.max_log_level())
        .init();

    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("cannot listen for interrupt signal: {err}");
            std::future::pending::<()>().await;
        }
        info!("received interrupt signal");
        let _ = shutdown.send(true);
    });

    let mut servers = JoinSet::new();
    for shard in shards {
        let config = Arc::clone(&config);
        let shutdown = wait_for_shutdown(shutdown_rx.clone());
        servers.spawn(async move {
            serve(&config, shard, shutdown)
                .await
                .map_err(|err| format!("{shard}: {err}"))
        });
    }
    while let Some(result) = servers.join_next().await {
        result??;
    }
    Ok(())
}
