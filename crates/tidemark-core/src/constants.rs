//! Network parameters and sync tuning constants.

use serde::{Deserialize, Serialize};

/// Network type: Mainnet, Testnet, or Regtest.
///
/// Selects address parameters, the default bitcoind port and the data
/// directory suffix.
///
/// # Examples
///
/// ```
/// use tidemark_core::constants::NetworkType;
/// let net = NetworkType::default();
/// assert_eq!(net, NetworkType::Mainnet);
/// assert_eq!(net.to_bitcoin(), bitcoin::Network::Bitcoin);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression-test network.
    Regtest,
}

impl NetworkType {
    /// The `bitcoin` crate network with the same address parameters.
    pub fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Self::Mainnet => bitcoin::Network::Bitcoin,
            Self::Testnet => bitcoin::Network::Testnet,
            Self::Regtest => bitcoin::Network::Regtest,
        }
    }

    /// Default bitcoind JSON-RPC port.
    pub fn default_node_rpc_port(&self) -> u16 {
        match self {
            Self::Mainnet => 8332,
            Self::Testnet => 18332,
            Self::Regtest => 18443,
        }
    }

    /// Subdirectory under the data dir for this network's index.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

/// Default port for the index query JSON-RPC server.
pub const DEFAULT_RPC_PORT: u16 = 28_480;

/// Per-event notifications are only fanned out while the local tip is
/// within this many blocks of the external tip.
pub const BROADCAST_DISTANCE: u64 = 100;

/// Maximum number of concurrent unconfirmed-transaction imports.
pub const TX_IMPORT_CONCURRENCY: usize = 10;

/// Number of txids removed per storage transaction during mempool reconciliation.
pub const MEMPOOL_REMOVAL_BATCH: usize = 250;

/// Delay between retries of a failed sync loop iteration, in milliseconds.
pub const SYNC_RETRY_BACKOFF_MS: u64 = 1_000;

/// Delay between retries of a failed local-tip read, in milliseconds.
pub const TIP_REFRESH_BACKOFF_MS: u64 = 1_000;

/// Delay between retries of a failed mempool reconciliation, in milliseconds.
pub const MEMPOOL_RETRY_BACKOFF_MS: u64 = 5_000;

/// Interval at which the bitcoind poller checks for new blocks and mempool entries.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

/// Capacity of the internal broadcast channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Sentinel output index of a coinbase input's previous outpoint.
pub const COINBASE_VOUT: u32 = 0xFFFF_FFFF;
