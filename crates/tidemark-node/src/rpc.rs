//! JSON-RPC query server for the index.
//!
//! Uses jsonrpsee 0.24 to expose sync status, blocks, transactions,
//! address history, and the unconfirmed set.

use std::sync::Arc;

use bitcoin::block::Header;
use bitcoin::consensus::encode::deserialize;
use chrono::DateTime;
use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};

use tidemark_core::index::HistoryEntry;
use tidemark_core::types::Hash256;
use tidemark_sync::SyncState;

use crate::error::NodeError;
use crate::node::Node;

/// JSON representation of the sync status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusJson {
    /// Engine state: `idle`, `catching_up`, or `rolling_back`.
    pub state: String,
    /// Height of the highest indexed block.
    pub blocks: Option<u64>,
    pub bestblockhash: Option<String>,
    /// Height of the upstream best block, as last seen.
    pub upstream_blocks: Option<u64>,
    /// Whether per-event notifications are being published.
    pub broadcasting: bool,
    pub orphans: usize,
    pub mempool_size: usize,
}

/// JSON representation of an indexed block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockJson {
    pub hash: String,
    pub height: u64,
    pub version: i32,
    pub prev_hash: String,
    pub merkle_root: String,
    /// Block timestamp (Unix seconds).
    pub time: u32,
    /// Block timestamp as RFC 3339.
    pub time_utc: String,
    pub bits: u32,
    pub nonce: u32,
    pub tx: Vec<String>,
}

/// JSON representation of an indexed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionJson {
    pub txid: String,
    /// Confirmation height; absent while unconfirmed.
    pub height: Option<u64>,
    pub size: usize,
    /// Consensus-serialized transaction as hex.
    pub hex: String,
}

/// One output received by an address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryJson {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub height: Option<u64>,
    pub spent_txid: Option<String>,
    pub spent_vin: Option<u32>,
    pub spent_height: Option<u64>,
}

impl From<HistoryEntry> for HistoryJson {
    fn from(entry: HistoryEntry) -> Self {
        Self {
            txid: entry.output.txid.to_string(),
            vout: entry.output.vout,
            value: entry.value,
            height: entry.height,
            spent_txid: entry.spent_by.map(|s| s.txid.to_string()),
            spent_vin: entry.spent_by.map(|s| s.vin),
            spent_height: entry.spent_height,
        }
    }
}

/// Parse a 64-character display-order hex string into a Hash256.
pub fn parse_hash(hex_str: &str) -> Result<Hash256, ErrorObjectOwned> {
    if hex_str.len() != 64 {
        return Err(rpc_error(-8, "hash must be 64 hex characters"));
    }
    hex_str.parse().map_err(|_| rpc_error(-8, "invalid hex in hash"))
}

/// Create a JSON-RPC error.
fn rpc_error(code: i32, msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, msg.to_string(), None::<()>)
}

fn internal(e: impl std::fmt::Display) -> ErrorObjectOwned {
    rpc_error(-1, &e.to_string())
}

fn state_name(state: SyncState) -> String {
    match state {
        SyncState::Idle => "idle",
        SyncState::CatchingUp => "catching_up",
        SyncState::RollingBack => "rolling_back",
    }
    .to_string()
}

/// The Tidemark JSON-RPC interface.
#[rpc(server)]
pub trait TidemarkRpc {
    /// Returns sync progress and index counters.
    #[method(name = "getstatus")]
    async fn get_status(&self) -> Result<StatusJson, ErrorObjectOwned>;

    /// Returns the indexed block at the given height.
    #[method(name = "getblockbyheight")]
    async fn get_block_by_height(&self, height: u64) -> Result<BlockJson, ErrorObjectOwned>;

    /// Returns an indexed transaction, confirmed or not.
    #[method(name = "gettransaction")]
    async fn get_transaction(&self, txid: String) -> Result<TransactionJson, ErrorObjectOwned>;

    /// Returns every output an address received, with spend status.
    #[method(name = "getaddresshistory")]
    async fn get_address_history(&self, address: String) -> Result<Vec<HistoryJson>, ErrorObjectOwned>;

    /// Returns the unspent outputs of an address.
    #[method(name = "getaddressunspent")]
    async fn get_address_unspent(&self, address: String) -> Result<Vec<HistoryJson>, ErrorObjectOwned>;

    /// Returns the txids of all unconfirmed indexed transactions.
    #[method(name = "getmempool")]
    async fn get_mempool(&self) -> Result<Vec<String>, ErrorObjectOwned>;
}

/// RPC server implementation backed by a [`Node`].
pub struct RpcServerImpl {
    node: Arc<Node>,
}

impl RpcServerImpl {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl TidemarkRpcServer for RpcServerImpl {
    async fn get_status(&self) -> Result<StatusJson, ErrorObjectOwned> {
        let status = self.node.status().map_err(internal)?;
        Ok(StatusJson {
            state: state_name(status.state),
            blocks: status.local_tip.map(|t| t.height),
            bestblockhash: status.local_tip.map(|t| t.hash.to_string()),
            upstream_blocks: status.external_tip.map(|t| t.height),
            broadcasting: status.broadcast_enabled,
            orphans: status.orphans,
            mempool_size: status.unconfirmed,
        })
    }

    async fn get_block_by_height(&self, height: u64) -> Result<BlockJson, ErrorObjectOwned> {
        let row = self
            .node
            .index()
            .block_at(height)
            .map_err(internal)?
            .ok_or_else(|| rpc_error(-8, "block height out of range"))?;
        let header: Header = deserialize(&row.header).map_err(internal)?;
        let time_utc = DateTime::from_timestamp(i64::from(header.time), 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        Ok(BlockJson {
            hash: row.hash.to_string(),
            height,
            version: header.version.to_consensus(),
            prev_hash: header.prev_blockhash.to_string(),
            merkle_root: header.merkle_root.to_string(),
            time: header.time,
            time_utc,
            bits: header.bits.to_consensus(),
            nonce: header.nonce,
            tx: row.txids.iter().map(ToString::to_string).collect(),
        })
    }

    async fn get_transaction(&self, txid: String) -> Result<TransactionJson, ErrorObjectOwned> {
        let hash = parse_hash(&txid)?;
        let row = self
            .node
            .index()
            .transaction(&hash)
            .map_err(internal)?
            .ok_or_else(|| rpc_error(-5, "transaction not found"))?;
        Ok(TransactionJson {
            txid: hash.to_string(),
            height: row.height,
            size: row.raw.len(),
            hex: hex::encode(&row.raw),
        })
    }

    async fn get_address_history(&self, address: String) -> Result<Vec<HistoryJson>, ErrorObjectOwned> {
        let entries = self.node.index().address_history(&address).map_err(internal)?;
        Ok(entries.into_iter().map(HistoryJson::from).collect())
    }

    async fn get_address_unspent(&self, address: String) -> Result<Vec<HistoryJson>, ErrorObjectOwned> {
        let entries = self.node.index().address_unspent(&address).map_err(internal)?;
        Ok(entries.into_iter().map(HistoryJson::from).collect())
    }

    async fn get_mempool(&self) -> Result<Vec<String>, ErrorObjectOwned> {
        let txids = self.node.index().unconfirmed_txids().map_err(internal)?;
        Ok(txids.iter().map(ToString::to_string).collect())
    }
}

/// Start the JSON-RPC server on `addr`.
pub async fn start_rpc_server(addr: &str, node: Arc<Node>) -> Result<ServerHandle, NodeError> {
    let server = Server::builder()
        .build(addr)
        .await
        .map_err(|e| NodeError::Rpc(e.to_string()))?;
    let rpc_impl = RpcServerImpl::new(node);
    Ok(server.start(rpc_impl.into_rpc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonrpsee::core::client::ClientT;
    use jsonrpsee::http_client::HttpClientBuilder;
    use jsonrpsee::rpc_params;
    use tidemark_core::constants::NetworkType;
    use tidemark_core::index::InputRef;
    use tidemark_core::types::{BlockExt, OutPoint, TransactionExt};
    use tidemark_sync::testing::{ChainBuilder, MockChain, fast_sync_config};

    use crate::config::NodeConfig;

    #[test]
    fn parse_hash_valid() {
        let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        assert_eq!(parse_hash(hex).unwrap().to_string(), hex);
    }

    #[test]
    fn parse_hash_wrong_length() {
        assert!(parse_hash("abcd").is_err());
    }

    #[test]
    fn parse_hash_invalid_hex() {
        assert!(parse_hash(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn history_json_flattens_spend() {
        let entry = HistoryEntry {
            output: OutPoint::new(Hash256([1; 32]), 2),
            value: 500,
            height: Some(7),
            spent_by: Some(InputRef { txid: Hash256([3; 32]), vin: 1 }),
            spent_height: None,
        };
        let json = serde_json::to_string(&HistoryJson::from(entry)).unwrap();
        assert!(json.contains("\"vout\":2"));
        assert!(json.contains("\"spent_vin\":1"));
        assert!(json.contains("\"spent_height\":null"));
    }

    #[tokio::test]
    async fn serves_indexed_data() {
        let mut chain = ChainBuilder::new();
        let b0 = chain.mine(vec![]);
        let spend = chain.spend(&[OutPoint::new(b0.txdata[0].id(), 0)], 4_000, 5);
        chain.mine(vec![spend.clone()]);

        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            network_type: NetworkType::Regtest,
            data_dir: dir.path().to_path_buf(),
            sync: fast_sync_config(),
            ..NodeConfig::default()
        };
        let source = Arc::new(MockChain::from_blocks(chain.blocks().to_vec()));
        let node = Node::with_source(config, source).unwrap();
        node.engine().sync(false).await;

        let server = Server::builder().build("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.start(RpcServerImpl::new(Arc::clone(&node)).into_rpc());
        let client = HttpClientBuilder::default().build(format!("http://{addr}")).unwrap();

        let status: StatusJson = client.request("getstatus", rpc_params![]).await.unwrap();
        assert_eq!(status.blocks, Some(1));
        assert_eq!(status.state, "idle");

        let block: BlockJson = client.request("getblockbyheight", rpc_params![1]).await.unwrap();
        assert_eq!(block.tx[1], spend.id().to_string());
        assert_eq!(block.prev_hash, b0.id().to_string());

        let tx: TransactionJson = client
            .request("gettransaction", rpc_params![spend.id().to_string()])
            .await
            .unwrap();
        assert_eq!(tx.height, Some(1));

        let address = chain.address_for(5);
        let unspent: Vec<HistoryJson> =
            client.request("getaddressunspent", rpc_params![address]).await.unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].value, 4_000);

        let missing = client
            .request::<TransactionJson, _>("gettransaction", rpc_params!["00".repeat(32)])
            .await;
        assert!(missing.is_err());

        handle.stop().unwrap();
    }
}
