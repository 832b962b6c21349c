use shardfs::placement::ShardId;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir, tempdir};

/// A `shardfs-server all` process listening on fixed ports.
pub struct ShardfsTestServer {
    _config_file: NamedTempFile,
    roots: TempDir,
    process: Child,
}

impl Default for ShardfsTestServer {
    fn default() -> Self {
        Self::new(&["all"], &BTreeMap::default())
    }
}

impl ShardfsTestServer {
    pub fn addr(shard: ShardId) -> SocketAddr {
        let port = match shard {
            ShardId::S1 => 18700,
            ShardId::S2 => 18701,
            ShardId::S3 => 18702,
            ShardId::S4 => 18703,
        };
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    pub fn new(args: &[&str], env: &BTreeMap<String, String>) -> Self {
        let roots = tempdir().unwrap();
        let config_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let mut config = String::new();
        for shard in ShardId::ALL {
            config.push_str(&format!(
                "[shards.{}]\nbind_addr = '{}'\nroot = '{}'\n\n",
                shard.name().to_lowercase(),
                Self::addr(shard),
                roots.path().join(shard.name()).display()
            ));
        }
        fs::write(config_file.path(), config).unwrap();

        let mut command = Command::new(env!("CARGO_BIN_EXE_shardfs-server"));
        command.args(args);
        command.env("SHARDFS_CONFIG_FILE", config_file.path());
        for (key, value) in env {
            command.env(key, value);
        }
        let process = command.spawn().expect("failed to start shardfs-server");
        Self {
            _config_file: config_file,
            roots,
            process,
        }
    }

    pub fn root(&self, shard: ShardId) -> PathBuf {
        self.roots.path().join(shard.name())
    }

    /// Whether all servers accept connections.
    pub fn is_ready(&self) -> bool {
        ShardId::ALL
            .into_iter()
            .all(|shard| TcpStream::connect(Self::addr(shard)).is_ok())
    }

    /// Wait until the servers are ready or timeout after 5 seconds.
    pub fn wait_until_ready(self) -> Result<Self, WaitTimeout> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if self.is_ready() {
                return Ok(self);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Err(WaitTimeout)
    }

    /// Wait for the process to exit, with a timeout of 5 seconds, and return whether it
    /// succeeded.
    pub fn wait_for_exit(mut self) -> Result<bool, WaitTimeout> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if let Some(status) = self.process.try_wait().unwrap() {
                return Ok(status.success());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        Err(WaitTimeout)
    }
}

impl Drop for ShardfsTestServer {
    fn drop(&mut self) {
        if let Err(e) = self.process.kill() {
            eprintln!("Failed to kill shardfs-server: {}", e);
        }
        let _ = self.process.wait();
    }
}

/// Error indicating that a wait operation has timed out.
#[derive(Debug)]
pub struct WaitTimeout;

impl Display for WaitTimeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Wait timeout exceeded")
    }
}

impl std::error::Error for WaitTimeout {}
