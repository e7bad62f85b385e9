//! Tidemark indexer binary.
//!
//! Follows a bitcoind node, keeps a RocksDB address/transaction index in
//! step with it across reorgs, and serves queries over JSON-RPC.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use tidemark_core::constants::NetworkType;
use tidemark_node_lib::{Node, NodeConfig, start_rpc_server};
use tracing::{error, info};

/// Tidemark: a reorg-aware blockchain indexer.
#[derive(Parser, Debug)]
#[command(
    name = "tidemark-node",
    version,
    about = "Reorg-aware block, transaction, and address indexer for bitcoind"
)]
struct Args {
    /// TOML configuration file. CLI flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the index
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// RPC server bind address
    #[arg(long)]
    rpc_bind: Option<String>,

    /// RPC server port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// bitcoind JSON-RPC URL (defaults to the network's local port)
    #[arg(long)]
    bitcoind_url: Option<String>,

    /// bitcoind RPC user
    #[arg(long)]
    bitcoind_user: Option<String>,

    /// bitcoind RPC password (prefer TIDEMARK_BITCOIND__PASSWORD)
    #[arg(long)]
    bitcoind_password: Option<String>,

    /// How often to poll bitcoind, in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Do not resend stale unconfirmed transactions on startup or reconnect
    #[arg(long)]
    no_resubmit: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Follow the public test network (testnet) instead of mainnet.
    #[arg(long, conflicts_with = "regtest")]
    testnet: bool,

    /// Follow a local regression-test chain (regtest).
    #[arg(long, conflicts_with = "testnet")]
    regtest: bool,
}

impl Args {
    /// Load the config file (if any) and apply CLI overrides.
    fn into_config(self) -> anyhow::Result<(NodeConfig, String)> {
        let mut config = NodeConfig::load(self.config.as_deref()).context("loading configuration")?;

        if self.regtest {
            config.network_type = NetworkType::Regtest;
        } else if self.testnet {
            config.network_type = NetworkType::Testnet;
        }
        config.sync.network = config.network_type;

        config.data_dir = match self.data_dir {
            Some(dir) => dir,
            None => config.data_dir.join(config.network_type.data_dir_suffix()),
        };
        if let Some(bind) = self.rpc_bind {
            config.rpc_bind = bind;
        }
        if let Some(port) = self.rpc_port {
            config.rpc_port = port;
        }
        if let Some(url) = self.bitcoind_url {
            config.bitcoind.url = url;
        }
        if let Some(user) = self.bitcoind_user {
            config.bitcoind.user = Some(user);
        }
        if let Some(password) = self.bitcoind_password {
            config.bitcoind.password = Some(password);
        }
        if let Some(interval) = self.poll_interval_ms {
            config.bitcoind.poll_interval_ms = interval;
        }
        if self.no_resubmit {
            config.sync.resubmit = false;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        Ok((config, self.log_format))
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let (config, log_format) = match args.into_config() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(2);
        }
    };

    init_logging(&config.log_level, &log_format);

    info!("Tidemark indexer v{}", env!("CARGO_PKG_VERSION"));
    info!(network = ?config.network_type, data_dir = ?config.data_dir, "starting");
    info!(rpc_addr = %config.rpc_addr(), bitcoind = %config.bitcoind_url(), "endpoints");

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("failed to create data_dir: {e}");
        process::exit(1);
    }

    let node = match Node::new(config.clone()) {
        Ok(n) => n,
        Err(e) => {
            error!("failed to start node: {e}");
            process::exit(1);
        }
    };

    match node.index().tip() {
        Ok(Some(tip)) => info!(height = tip.height, hash = %tip.hash, "index tip"),
        Ok(None) => info!("index is empty"),
        Err(e) => error!("failed to read index tip: {e}"),
    }

    let rpc_handle = match start_rpc_server(&config.rpc_addr(), node.clone()).await {
        Ok(handle) => {
            info!("RPC server listening on {}", config.rpc_addr());
            handle
        }
        Err(e) => {
            error!("failed to start RPC server: {e}");
            process::exit(1);
        }
    };

    info!("Tidemark running (Ctrl+C to stop)");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = node.run() => {
            info!("node event loop exited");
        }
        _ = shutdown_signal => {
            info!("shutdown signal received");
        }
    }

    rpc_handle.stop().ok();
    info!("RPC server stopped");
    info!("Tidemark shutdown complete");
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `RUST_LOG` takes precedence over `level_str`. Pass `format = "json"`
/// for structured JSON output; any other value gives human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "tidemark-node",
            "--regtest",
            "--data-dir",
            "/tmp/tm",
            "--rpc-port",
            "9000",
            "--bitcoind-user",
            "bob",
            "--no-resubmit",
        ]);
        let (config, format) = args.into_config().unwrap();
        assert_eq!(config.network_type, NetworkType::Regtest);
        assert_eq!(config.sync.network, NetworkType::Regtest);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/tm"));
        assert_eq!(config.rpc_port, 9000);
        assert_eq!(config.bitcoind.user.as_deref(), Some("bob"));
        assert!(!config.sync.resubmit);
        assert_eq!(format, "text");
    }

    #[test]
    fn default_data_dir_is_per_network() {
        let args = Args::parse_from(["tidemark-node", "--testnet"]);
        let (config, _) = args.into_config().unwrap();
        assert!(config.data_dir.ends_with("tidemark/testnet"));
    }
}
