//! Node configuration.
//!
//! [`NodeConfig`] carries defaults for the data directory, RPC binding,
//! upstream bitcoind endpoint, and sync tuning. [`NodeConfig::load`] layers
//! an optional TOML file and `TIDEMARK_*` environment variables on top of
//! those defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tidemark_core::constants::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_RPC_PORT, NetworkType};
use tidemark_sync::SyncConfig;

use crate::error::NodeError;

/// Connection settings for the upstream bitcoind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitcoindConfig {
    /// JSON-RPC endpoint. Empty means the network's default local port.
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// How often to poll for new blocks and mempool entries.
    pub poll_interval_ms: u64,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for BitcoindConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: None,
            password: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timeout_ms: 30_000,
        }
    }
}

impl BitcoindConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for a node instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Which chain the upstream node follows.
    pub network_type: NetworkType,
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// IP address for the query JSON-RPC server to bind to.
    pub rpc_bind: String,
    /// Port for the query JSON-RPC server.
    pub rpc_port: u16,
    /// Upstream node connection.
    pub bitcoind: BitcoindConfig,
    /// Sync engine tuning.
    pub sync: SyncConfig,
    /// Log level filter string (e.g. "info", "debug", "tidemark_sync=trace").
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tidemark");

        Self {
            network_type: NetworkType::Mainnet,
            data_dir,
            rpc_bind: "127.0.0.1".to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            bitcoind: BitcoindConfig::default(),
            sync: SyncConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Build a configuration from defaults, then `path` (TOML, if given),
    /// then `TIDEMARK_*` environment variables. Nested keys use `__`, e.g.
    /// `TIDEMARK_BITCOIND__URL`.
    pub fn load(path: Option<&Path>) -> Result<Self, NodeError> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| NodeError::Config(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TIDEMARK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let mut cfg: Self = builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| NodeError::Config(e.to_string()))?;
        cfg.sync.network = cfg.network_type;
        Ok(cfg)
    }

    /// Path to the RocksDB index directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    /// Socket address string for the RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind, self.rpc_port)
    }

    /// Upstream endpoint, falling back to the network's default local port.
    pub fn bitcoind_url(&self) -> String {
        if self.bitcoind.url.is_empty() {
            format!("http://127.0.0.1:{}", self.network_type.default_node_rpc_port())
        } else {
            self.bitcoind.url.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_rpc_addr() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.rpc_addr(), format!("127.0.0.1:{DEFAULT_RPC_PORT}"));
    }

    #[test]
    fn default_data_dir_ends_with_tidemark() {
        let cfg = NodeConfig::default();
        assert!(
            cfg.data_dir.ends_with("tidemark"),
            "data_dir should end with 'tidemark': {:?}",
            cfg.data_dir
        );
    }

    #[test]
    fn db_path_appends_index() {
        let cfg = NodeConfig {
            data_dir: PathBuf::from("/tmp/tidemark-test"),
            ..NodeConfig::default()
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/tidemark-test/index"));
    }

    #[test]
    fn bitcoind_url_defaults_per_network() {
        let cfg = NodeConfig { network_type: NetworkType::Regtest, ..NodeConfig::default() };
        assert_eq!(cfg.bitcoind_url(), "http://127.0.0.1:18443");

        let mut custom = cfg.clone();
        custom.bitcoind.url = "http://node:8332".into();
        assert_eq!(custom.bitcoind_url(), "http://node:8332");
    }

    #[test]
    fn load_without_file_gives_defaults() {
        let cfg = NodeConfig::load(None).unwrap();
        assert_eq!(cfg.rpc_port, DEFAULT_RPC_PORT);
        assert_eq!(cfg.sync, SyncConfig::default());
    }

    #[test]
    fn load_layers_toml_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
network_type = "regtest"
rpc_port = 9999

[bitcoind]
url = "http://127.0.0.1:18443"
user = "alice"

[sync]
removal_batch_size = 50
"#
        )
        .unwrap();

        let cfg = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.network_type, NetworkType::Regtest);
        assert_eq!(cfg.rpc_port, 9999);
        assert_eq!(cfg.bitcoind.user.as_deref(), Some("alice"));
        assert_eq!(cfg.bitcoind.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(cfg.sync.removal_batch_size, 50);
        assert_eq!(cfg.sync.network, NetworkType::Regtest);
    }
}
