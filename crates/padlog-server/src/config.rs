//! Node configuration loaded from environment variables.
//!
//! All settings have sensible defaults so a single-shard node can start with
//! zero configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use padlog_shared::constants::{
    CHECKPOINT_WINDOW, DEFAULT_HTTP_PORT, DEFAULT_SHARD_ROLE, TAIL_KEEP, UNCONVENTIONAL_THRESHOLD,
};
use padlog_shared::{ShardId, ShardRouter};
use padlog_store::{IndexLimits, StoreConfig};

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory of the channel logs.
    /// Env: `DATA_PATH`
    /// Default: `./datastore`
    pub data_path: PathBuf,

    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:3014`
    pub http_addr: SocketAddr,

    /// Role part of this node's shard id.
    /// Env: `SHARD_ROLE`
    /// Default: `core`
    pub shard_role: String,

    /// Number of shards sharing the role.
    /// Env: `SHARD_COUNT`
    /// Default: `1`
    pub shard_count: u32,

    /// This node's index within the role.
    /// Env: `SHARD_INDEX`
    /// Default: `0`
    pub shard_index: u32,

    /// Channel state unused for this long is evicted from memory.
    /// Env: `INDEX_IDLE_SECS`
    /// Default: `600`
    pub index_idle: Duration,

    /// How often the eviction sweep runs.
    /// Env: `EVICTION_INTERVAL_SECS`
    /// Default: `60`
    pub eviction_interval: Duration,

    /// Index retention limits.
    /// Env: `UNCONVENTIONAL_THRESHOLD`, `TAIL_KEEP`, `CHECKPOINT_WINDOW`
    pub limits: IndexLimits,

    /// Sync every append to disk before acknowledging.
    /// Env: `FSYNC` (true/false)
    /// Default: `true`
    pub fsync: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./datastore"),
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            shard_role: DEFAULT_SHARD_ROLE.to_string(),
            shard_count: 1,
            shard_index: 0,
            index_idle: Duration::from_secs(600),
            eviction_interval: Duration::from_secs(60),
            limits: IndexLimits::default(),
            fsync: true,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("DATA_PATH") {
            config.data_path = PathBuf::from(path);
        }
        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(role) = lookup("SHARD_ROLE").filter(|r| !r.is_empty()) {
            config.shard_role = role;
        }
        parse_into(&lookup, "SHARD_COUNT", &mut config.shard_count);
        parse_into(&lookup, "SHARD_INDEX", &mut config.shard_index);
        if config.shard_count == 0 {
            tracing::warn!("SHARD_COUNT must be at least 1, using 1");
            config.shard_count = 1;
        }

        let mut idle = config.index_idle.as_secs();
        parse_into(&lookup, "INDEX_IDLE_SECS", &mut idle);
        config.index_idle = Duration::from_secs(idle);

        let mut interval = config.eviction_interval.as_secs();
        parse_into(&lookup, "EVICTION_INTERVAL_SECS", &mut interval);
        config.eviction_interval = Duration::from_secs(interval.max(1));

        let limits = &mut config.limits;
        parse_into(&lookup, "UNCONVENTIONAL_THRESHOLD", &mut limits.unconventional_threshold);
        parse_into(&lookup, "TAIL_KEEP", &mut limits.tail_keep);
        parse_into(&lookup, "CHECKPOINT_WINDOW", &mut limits.checkpoint_window);
        if limits.tail_keep > limits.unconventional_threshold {
            tracing::warn!(
                tail_keep = limits.tail_keep,
                threshold = limits.unconventional_threshold,
                "TAIL_KEEP exceeds UNCONVENTIONAL_THRESHOLD, using defaults"
            );
            limits.unconventional_threshold = UNCONVENTIONAL_THRESHOLD;
            limits.tail_keep = TAIL_KEEP;
        }
        if limits.checkpoint_window == 0 {
            limits.checkpoint_window = CHECKPOINT_WINDOW;
        }

        if let Some(val) = lookup("FSYNC") {
            config.fsync = val != "false" && val != "0";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn router(&self) -> ShardRouter {
        ShardRouter::new(self.shard_role.clone(), self.shard_count)
    }

    /// Shard id this node answers for.
    pub fn local_shard(&self) -> ShardId {
        self.router().shard(self.shard_index)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            root: self.data_path.clone(),
            limits: self.limits,
            fsync: self.fsync,
        }
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid configuration value, using default"),
    }
}
