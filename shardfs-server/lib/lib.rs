//! Library module for shardfs-server
//!
//! This library module exists for two reasons:
//!
//! 1. To share code between the coordinator and the storage nodes run by the `shardfs-server`
//!    binary.
//! 2. To share code with the integration tests of the `shardfs-server` and `shardfs-cli`.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod listing;
pub mod node;
pub mod sink;
#[cfg(feature = "test")]
pub mod test_cluster;

use crate::config::ShardfsConfig;
use crate::coordinator::Coordinator;
use crate::dispatcher::Dispatcher;
use crate::node::StorageNode;
use shardfs::client::NodeClient;
use shardfs::placement::ShardId;
use shardfs::storage::filesystem::FilesystemStorage;
use std::fs;
use std::future::Future;
use std::io;
use tokio::sync::watch;
use tracing::warn;

/// Runs the server of one shard until `shutdown` completes.
///
/// For [ShardId::S1] this is the coordinator, for all other shards a storage node.
pub async fn serve<F: Future<Output = ()>>(
    config: &ShardfsConfig,
    shard: ShardId,
    shutdown: F,
) -> io::Result<()> {
    let bind_addr = config.shard(shard).bind_addr;
    if shard.is_local() {
        Dispatcher::bind(shard.name(), bind_addr, build_coordinator(config)?)
            .await?
            .run(shutdown)
            .await
    } else {
        Dispatcher::bind(shard.name(), bind_addr, build_storage_node(config, shard)?)
            .await?
            .run(shutdown)
            .await
    }
}

/// Sets up the coordinator, which talks to the storage nodes at their configured addresses.
pub fn build_coordinator(config: &ShardfsConfig) -> io::Result<Coordinator> {
    let nodes = ShardId::REMOTE
        .into_iter()
        .map(|shard| NodeClient::new(shard, config.shard(shard).bind_addr))
        .collect();
    Ok(Coordinator::new(
        open_storage(config, ShardId::S1)?,
        nodes,
        config.archiver(),
    ))
}

pub fn build_storage_node(config: &ShardfsConfig, shard: ShardId) -> io::Result<StorageNode> {
    Ok(StorageNode::new(
        shard,
        open_storage(config, shard)?,
        config.archiver(),
    ))
}

/// Prepares the storage root of a shard, creating it if necessary.
pub fn open_storage(config: &ShardfsConfig, shard: ShardId) -> io::Result<FilesystemStorage> {
    let root = &config.shard(shard).root;
    fs::create_dir_all(root)?;
    let storage = FilesystemStorage::new(root.clone());
    if config.clean_leftover_tmp_files
        && let Err(err) = storage.clean_leftover_tmp_files()
    {
        warn!(%shard, root = %root.display(), "failed to clean leftover staging files: {err}");
    }
    Ok(storage)
}

/// Completes once `true` was sent on the channel or all senders were dropped.
pub async fn wait_for_shutdown(mut receiver: watch::Receiver<bool>) {
    // An error means all senders are gone, which is treated as shutdown, too.
    let _ = receiver.wait_for(|shutdown| *shutdown).await;
}
