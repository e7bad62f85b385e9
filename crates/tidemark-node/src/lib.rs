//! # tidemark-node: RocksDB, bitcoind, RPC, orchestration.
//!
//! Composes the Tidemark subsystems into a running indexer:
//! - [`storage::RocksStore`]: persistent index storage backed by RocksDB
//! - [`bitcoind::BitcoindClient`]: upstream chain access and event polling
//! - [`notify::BroadcastNotifier`]: fan-out of committed index notifications
//! - [`node::Node`]: wiring of storage, source, and sync engine
//! - [`rpc`]: JSON-RPC query server
//! - [`config::NodeConfig`]: node configuration

pub mod bitcoind;
pub mod config;
pub mod error;
pub mod node;
pub mod notify;
pub mod rpc;
pub mod storage;

pub use config::NodeConfig;
pub use error::NodeError;
pub use node::{Node, NodeStatus};
pub use rpc::start_rpc_server;
pub use storage::RocksStore;
