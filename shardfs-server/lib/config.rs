//! Configuration of the coordinator and the storage nodes.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source};
use shardfs::archive::{Archiver, CommandArchiver, TarArchiver};
use shardfs::placement::ShardId;
use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::Level;

#[derive(Clone, Debug, serde::Deserialize, PartialEq, Eq)]
pub struct ShardfsConfig {
    pub log_level: String,
    pub archive_tool: String,
    pub clean_leftover_tmp_files: bool,
    pub shards: ShardsConfig,
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq, Eq)]
pub struct ShardsConfig {
    pub s1: ShardConfig,
    pub s2: ShardConfig,
    pub s3: ShardConfig,
    pub s4: ShardConfig,
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq, Eq)]
pub struct ShardConfig {
    pub bind_addr: SocketAddr,
    pub root: PathBuf,
}

impl ShardfsConfig {
    pub fn load() -> Result<Self, LoadConfigError> {
        ConfigLoader::new().add_default_sources().load()
    }

    pub fn shard(&self, shard: ShardId) -> &ShardConfig {
        match shard {
            ShardId::S1 => &self.shards.s1,
            ShardId::S2 => &self.shards.s2,
            ShardId::S3 => &self.shards.s3,
            ShardId::S4 => &self.shards.s4,
        }
    }

    pub fn max_log_level(&self) -> Level {
        Level::from_str(&self.log_level).unwrap_or(Level::INFO)
    }

    /// The external archive tool if one is configured, the built-in archiver otherwise.
    pub fn archiver(&self) -> Arc<dyn Archiver> {
        if self.archive_tool.is_empty() {
            Arc::new(TarArchiver)
        } else {
            Arc::new(CommandArchiver::new(PathBuf::from(&self.archive_tool)))
        }
    }
}

#[derive(Debug)]
pub enum LoadConfigError {
    ConfigError(ConfigError),
    InvalidLogLevel(String),
}

impl Display for LoadConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadConfigError::ConfigError(err) => write!(f, "configuration error: {err}"),
            LoadConfigError::InvalidLogLevel(level) => {
                write!(f, "configuration error: invalid log level '{level}'")
            }
        }
    }
}

impl From<ConfigError> for LoadConfigError {
    fn from(err: ConfigError) -> Self {
        LoadConfigError::ConfigError(err)
    }
}

impl std::error::Error for LoadConfigError {}

pub struct ConfigLoader(ConfigBuilder<DefaultState>);

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        ConfigLoader(Config::builder())
    }

    pub fn add_default_sources(self) -> Self {
        self.add_file_source(
            File::with_name(
                &std::env::var("SHARDFS_CONFIG_FILE")
                    .map(Cow::Owned)
                    .unwrap_or(Cow::Borrowed("/etc/shardfs/config.toml")),
            )
            .required(false),
        )
        .add_environment_source(None)
    }

    pub fn add_file_source<T, F>(mut self, file: File<T, F>) -> Self
    where
        File<T, F>: Source + Send + Sync + 'static,
    {
        self.0 = self.0.add_source(file);
        self
    }

    pub fn add_environment_source(mut self, source: Option<Map<String, String>>) -> Self {
        self.0 = self.0.add_source(
            Environment::with_prefix("SHARDFS")
                .separator("__")
                .prefix_separator("_")
                .try_parsing(true)
                .source(source),
        );
        self
    }

    pub fn load(self) -> Result<ShardfsConfig, LoadConfigError> {
        let mut builder = self
            .0
            .set_default("log_level", "info")?
            .set_default("archive_tool", "")?
            .set_default("clean_leftover_tmp_files", true)?;
        for (i, shard) in ShardId::ALL.into_iter().enumerate() {
            let key = shard.name().to_lowercase();
            builder = builder
                .set_default(
                    format!("shards.{key}.bind_addr"),
                    format!("127.0.0.1:{}", 8000 + i),
                )?
                .set_default(
                    format!("shards.{key}.root"),
                    format!("/var/lib/shardfs/{shard}"),
                )?;
        }
        let config: ShardfsConfig = builder.build()?.try_deserialize()?;
        if Level::from_str(&config.log_level).is_err() {
            return Err(LoadConfigError::InvalidLogLevel(config.log_level));
        }
        Ok(config)
    }
}
