//! Upstream chain access over bitcoind's JSON-RPC interface.
//!
//! [`BitcoindClient`] implements [`ChainSource`] with plain HTTP JSON-RPC
//! calls. bitcoind has no push channel over RPC, so [`BitcoindClient::spawn_poller`]
//! polls the best block hash and the mempool and turns changes into
//! [`ChainEvent`]s.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode::{Decodable, deserialize};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tidemark_core::constants::EVENT_CHANNEL_CAPACITY;
use tidemark_core::error::{DecodeError, SourceError};
use tidemark_core::traits::{ChainEvent, ChainSource};
use tidemark_core::types::{Block, BlockExt, ChainTip, Hash256, Transaction};

/// bitcoind error codes mapped to [`SourceError::NotFound`].
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
const RPC_INVALID_PARAMETER: i64 = -8;
/// bitcoind error codes mapped to [`SourceError::Rejected`].
const RPC_VERIFY_ERROR: i64 = -25;
const RPC_VERIFY_REJECTED: i64 = -26;
const RPC_VERIFY_ALREADY_IN_CHAIN: i64 = -27;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl RpcResponse {
    fn into_result(self) -> Result<Value, SourceError> {
        match self.error {
            None => Ok(self.result),
            Some(RpcErrorBody { code, message }) => Err(match code {
                RPC_INVALID_ADDRESS_OR_KEY | RPC_INVALID_PARAMETER => SourceError::NotFound(message),
                RPC_VERIFY_ERROR | RPC_VERIFY_REJECTED | RPC_VERIFY_ALREADY_IN_CHAIN => {
                    SourceError::Rejected(message)
                }
                _ => SourceError::Rpc { code, message },
            }),
        }
    }
}

/// JSON-RPC client for a bitcoind node.
pub struct BitcoindClient {
    url: String,
    auth: Option<(String, Option<String>)>,
    client: Client,
    request_id: AtomicU64,
    events: broadcast::Sender<ChainEvent>,
}

impl BitcoindClient {
    pub fn new(
        url: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            url: url.into(),
            auth: user.map(|user| (user, password)),
            client,
            request_id: AtomicU64::new(1),
            events,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, SourceError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest { jsonrpc: "1.0", method, params, id };

        let mut http = self.client.post(&self.url).json(&request);
        if let Some((user, password)) = &self.auth {
            http = http.basic_auth(user, password.as_ref());
        }
        // bitcoind answers RPC errors with a non-2xx status and a JSON body,
        // so the body is parsed regardless of status.
        let response = http
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{method}: {e}")))?;
        let status = response.status();
        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(format!("{method} (HTTP {status}): {e}")))?;
        let value = body.into_result()?;
        serde_json::from_value(value).map_err(|e| SourceError::Malformed(format!("{method}: {e}")))
    }

    async fn best_block_hash(&self) -> Result<Hash256, SourceError> {
        let hex: String = self.call("getbestblockhash", json!([])).await?;
        parse_hash(&hex)
    }

    async fn block_hash(&self, height: u64) -> Result<Hash256, SourceError> {
        let hex: String = self.call("getblockhash", json!([height])).await?;
        parse_hash(&hex)
    }

    /// Poll bitcoind every `interval` and publish changes to subscribers.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut state = PollState::default();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let observed = async {
                    let best = client.best_block_hash().await?;
                    let mempool = client.mempool_txids().await?;
                    Ok::<_, SourceError>((best, mempool))
                }
                .await;
                let events = match observed {
                    Ok((best, mempool)) => state.observe(best, mempool),
                    Err(e) => {
                        if state.fail() {
                            warn!("lost connection to bitcoind: {e}");
                        } else {
                            debug!("bitcoind still unreachable: {e}");
                        }
                        continue;
                    }
                };
                for event in events {
                    if event == ChainEvent::Connected {
                        info!(url = %client.url, "connected to bitcoind");
                    }
                    // Nobody subscribed yet is fine.
                    let _ = client.events.send(event);
                }
            }
        })
    }
}

fn parse_hash(hex: &str) -> Result<Hash256, SourceError> {
    hex.parse().map_err(SourceError::Decode)
}

/// Decode a consensus-serialized object from bitcoind's hex form.
fn decode_hex<T: Decodable>(hex_str: &str) -> Result<T, SourceError> {
    let raw = hex::decode(hex_str).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
    Ok(deserialize(&raw).map_err(DecodeError::from)?)
}

#[async_trait]
impl ChainSource for BitcoindClient {
    async fn latest_tip(&self) -> Result<ChainTip, SourceError> {
        let height: u64 = self.call("getblockcount", json!([])).await?;
        let hash = self.block_hash(height).await?;
        Ok(ChainTip::new(height, hash))
    }

    async fn block_at(&self, height: u64) -> Result<Block, SourceError> {
        let hash = self.block_hash(height).await?;
        let hex: String = self.call("getblock", json!([hash.to_string(), 0])).await?;
        let block: Block = decode_hex(&hex)?;
        if block.id() != hash {
            return Err(SourceError::Malformed(format!("block {hash} hashes to {}", block.id())));
        }
        Ok(block)
    }

    async fn transaction(&self, txid: &Hash256) -> Result<Transaction, SourceError> {
        let hex: String = self.call("getrawtransaction", json!([txid.to_string(), false])).await?;
        decode_hex(&hex)
    }

    async fn mempool_txids(&self) -> Result<Vec<Hash256>, SourceError> {
        let txids: Vec<String> = self.call("getrawmempool", json!([])).await?;
        txids.iter().map(|t| parse_hash(t)).collect()
    }

    async fn send_transaction(&self, raw: &[u8]) -> Result<(), SourceError> {
        let _txid: String = self.call("sendrawtransaction", json!([hex::encode(raw)])).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }
}

/// What the poller saw last.
#[derive(Debug, Default)]
struct PollState {
    connected: bool,
    best: Option<Hash256>,
    mempool: HashSet<Hash256>,
}

impl PollState {
    /// Record a successful poll and return the events it implies.
    fn observe(&mut self, best: Hash256, mempool: Vec<Hash256>) -> Vec<ChainEvent> {
        let mut events = Vec::new();
        if !self.connected {
            self.connected = true;
            events.push(ChainEvent::Connected);
        }
        if self.best.is_some_and(|previous| previous != best) {
            events.push(ChainEvent::NewBlock);
        }
        self.best = Some(best);

        let mempool: HashSet<Hash256> = mempool.into_iter().collect();
        let mut fresh: Vec<Hash256> = mempool.difference(&self.mempool).copied().collect();
        fresh.sort();
        events.extend(fresh.into_iter().map(ChainEvent::NewTx));
        self.mempool = mempool;
        events
    }

    /// Record a failed poll. Returns true on the transition to disconnected.
    fn fail(&mut self) -> bool {
        std::mem::replace(&mut self.connected, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> Hash256 {
        Hash256([n; 32])
    }

    #[test]
    fn first_poll_connects_and_announces_mempool() {
        let mut state = PollState::default();
        let events = state.observe(h(1), vec![h(7)]);
        assert_eq!(events, vec![ChainEvent::Connected, ChainEvent::NewTx(h(7))]);
    }

    #[test]
    fn new_best_hash_is_a_new_block() {
        let mut state = PollState::default();
        state.observe(h(1), vec![]);
        assert!(state.observe(h(1), vec![]).is_empty());
        assert_eq!(state.observe(h(2), vec![]), vec![ChainEvent::NewBlock]);
    }

    #[test]
    fn only_fresh_mempool_entries_are_announced() {
        let mut state = PollState::default();
        state.observe(h(1), vec![h(5), h(6)]);
        let events = state.observe(h(1), vec![h(6), h(8)]);
        assert_eq!(events, vec![ChainEvent::NewTx(h(8))]);
    }

    #[test]
    fn reconnect_after_failure() {
        let mut state = PollState::default();
        state.observe(h(1), vec![]);
        assert!(state.fail());
        assert!(!state.fail());
        let events = state.observe(h(3), vec![]);
        assert_eq!(events, vec![ChainEvent::Connected, ChainEvent::NewBlock]);
    }

    #[test]
    fn rpc_error_codes_map_to_source_errors() {
        let parse = |body: &str| serde_json::from_str::<RpcResponse>(body).unwrap().into_result();

        let ok = parse(r#"{"result": 42, "error": null, "id": 1}"#).unwrap();
        assert_eq!(ok, json!(42));

        let missing = parse(r#"{"result": null, "error": {"code": -5, "message": "No such mempool or blockchain transaction"}, "id": 1}"#);
        assert!(matches!(missing, Err(SourceError::NotFound(_))));

        let rejected = parse(r#"{"result": null, "error": {"code": -26, "message": "txn-mempool-conflict"}, "id": 1}"#);
        assert!(matches!(rejected, Err(SourceError::Rejected(_))));

        let other = parse(r#"{"result": null, "error": {"code": -28, "message": "Loading block index..."}, "id": 1}"#);
        assert!(matches!(other, Err(SourceError::Rpc { code: -28, .. })));
    }

    #[test]
    fn raw_blocks_decode_from_hex() {
        let genesis = bitcoin::blockdata::constants::genesis_block(bitcoin::Network::Bitcoin);
        let hex = hex::encode(bitcoin::consensus::encode::serialize(&genesis));
        let decoded: Block = decode_hex(&hex).unwrap();
        assert_eq!(decoded.id(), genesis.id());

        assert!(matches!(decode_hex::<Block>("zz"), Err(SourceError::Decode(DecodeError::InvalidHex(_)))));
        assert!(matches!(decode_hex::<Block>("00"), Err(SourceError::Decode(DecodeError::Consensus(_)))));
    }

    #[test]
    fn hashes_parse_in_display_order() {
        assert!(parse_hash("abcd").is_err());
        let genesis = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        assert_eq!(parse_hash(genesis).unwrap().to_string(), genesis);
    }
}
