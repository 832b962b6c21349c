//! An in-process shardfs cluster for tests.

use crate::config::{ShardConfig, ShardfsConfig, ShardsConfig};
use crate::dispatcher::Dispatcher;
use crate::{build_coordinator, build_storage_node, wait_for_shutdown};
use shardfs::client::{CoordinatorClient, NodeClient};
use shardfs::placement::ShardId;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use tempfile::{TempDir, tempdir};
use tokio::runtime::{self, Runtime};
use tokio::sync::watch;

/// Kept far below the number of connections tests open, so connection handling never depends on
/// the runtime's blocking pool.
pub const BLOCKING_THREADS: usize = 4;

/// A coordinator and storage nodes listening on ephemeral loopback ports, with their storage
/// roots in a temporary directory.
///
/// The servers run on a dedicated Tokio runtime that is shut down when the cluster is dropped.
pub struct TestCluster {
    runtime: Option<Runtime>,
    shutdown: watch::Sender<bool>,
    config: ShardfsConfig,
    _roots: TempDir,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::start()
    }
}

impl TestCluster {
    /// Starts the coordinator and all storage nodes.
    pub fn start() -> Self {
        Self::with_nodes(&ShardId::REMOTE)
    }

    /// Starts the coordinator and only the given storage nodes.
    ///
    /// The coordinator is still configured with an address for the missing nodes, but nothing
    /// listens on it.
    pub fn with_nodes(nodes: &[ShardId]) -> Self {
        let roots = tempdir().expect("failed to create storage roots");
        let mut listeners = Vec::new();
        let mut shard_configs = Vec::new();
        for shard in ShardId::ALL {
            let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind listener");
            let bind_addr = listener.local_addr().expect("failed to get listener address");
            if shard.is_local() || nodes.contains(&shard) {
                listeners.push((shard, listener));
            }
            shard_configs.push(ShardConfig {
                bind_addr,
                root: roots.path().join(shard.name()),
            });
        }
        let [s1, s2, s3, s4]: [ShardConfig; 4] = shard_configs
            .try_into()
            .unwrap_or_else(|_| unreachable!("one config per shard"));
        let config = ShardfsConfig {
            log_level: "debug".to_string(),
            archive_tool: String::new(),
            clean_leftover_tmp_files: true,
            shards: ShardsConfig { s1, s2, s3, s4 },
        };

        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(BLOCKING_THREADS)
            .enable_all()
            .build()
            .expect("failed to create runtime");
        let (shutdown, shutdown_rx) = watch::channel(false);
        {
            let _guard = runtime.enter();
            for (shard, listener) in listeners {
                let shutdown = wait_for_shutdown(shutdown_rx.clone());
                if shard.is_local() {
                    let handler = build_coordinator(&config).expect("failed to set up coordinator");
                    let dispatcher = Dispatcher::from_std(shard.name(), listener, handler)
                        .expect("failed to set up listener");
                    runtime.spawn(dispatcher.run(shutdown));
                } else {
                    let handler =
                        build_storage_node(&config, shard).expect("failed to set up storage node");
                    let dispatcher = Dispatcher::from_std(shard.name(), listener, handler)
                        .expect("failed to set up listener");
                    runtime.spawn(dispatcher.run(shutdown));
                }
            }
        }

        Self {
            runtime: Some(runtime),
            shutdown,
            config,
            _roots: roots,
        }
    }

    pub fn config(&self) -> &ShardfsConfig {
        &self.config
    }

    pub fn addr(&self, shard: ShardId) -> SocketAddr {
        self.config.shard(shard).bind_addr
    }

    pub fn coordinator_addr(&self) -> SocketAddr {
        self.addr(ShardId::S1)
    }

    /// The storage root of a shard.
    pub fn root(&self, shard: ShardId) -> PathBuf {
        self.config.shard(shard).root.clone()
    }

    /// Connects a new client to the coordinator.
    pub fn client(&self) -> CoordinatorClient {
        CoordinatorClient::connect(self.coordinator_addr())
            .expect("failed to connect to coordinator")
    }

    pub fn node_client(&self, shard: ShardId) -> NodeClient {
        NodeClient::new(shard, self.addr(shard))
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(runtime) = self.runtime.take() {
            // Workers blocked on open connections are not waited for.
            runtime.shutdown_background();
        }
    }
}
