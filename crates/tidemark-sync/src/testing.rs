//! In-memory collaborators and chain builders for tests.
//!
//! Compiled for this crate's own tests and, through the `testing`
//! feature, for downstream test suites.

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::consensus::encode::deserialize;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, BlockHash, CompactTarget, PubkeyHash, ScriptBuf, Sequence, TxIn, TxMerkleNode,
    TxOut, Witness,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use tidemark_core::constants::{EVENT_CHANNEL_CAPACITY, NetworkType};
use tidemark_core::error::{DecodeError, SourceError};
use tidemark_core::notify::Notification;
use tidemark_core::traits::{ChainEvent, ChainSource, Notifier};
use tidemark_core::types::{Block, BlockExt, ChainTip, Hash256, OutPoint, Transaction, TransactionExt};

use crate::config::SyncConfig;

/// Block subsidy paid by generated coinbases.
pub const COINBASE_VALUE: u64 = 50 * 100_000_000;

/// P2PKH script paying to a key hash filled with `tag`.
pub fn p2pkh_script(tag: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([tag; 20]))
}

/// Sync configuration with millisecond backoffs, for tests that inject
/// failures.
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        network: NetworkType::Regtest,
        retry_backoff_ms: 1,
        tip_refresh_backoff_ms: 1,
        mempool_retry_backoff_ms: 1,
        ..SyncConfig::default()
    }
}

// ------------------------------------------------------------------
// ChainBuilder
// ------------------------------------------------------------------

/// Builds a linked chain of regtest blocks.
///
/// Two builders with different salts never produce the same block, which
/// is how forks are made.
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    blocks: Vec<Block>,
    salt: u8,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::with_salt(0)
    }

    pub fn with_salt(salt: u8) -> Self {
        Self { blocks: Vec::new(), salt }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn tip(&self) -> Option<ChainTip> {
        let block = self.blocks.last()?;
        Some(ChainTip::new(self.blocks.len() as u64 - 1, block.id()))
    }

    /// Copy of the first `height + 1` blocks; blocks mined on the copy
    /// diverge from this chain.
    pub fn fork_at(&self, height: u64) -> Self {
        let keep = (height as usize + 1).min(self.blocks.len());
        Self {
            blocks: self.blocks[..keep].to_vec(),
            salt: self.salt.wrapping_add(1),
        }
    }

    /// Coinbase for the next block, paying to `p2pkh_script(0)`.
    pub fn coinbase(&self) -> Transaction {
        let height = self.blocks.len() as u64;
        let mut script_sig = height.to_le_bytes().to_vec();
        script_sig.push(self.salt);
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: bitcoin::OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(script_sig),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(COINBASE_VALUE),
                script_pubkey: p2pkh_script(0),
            }],
        }
    }

    /// Append a block holding a coinbase followed by `txs`.
    pub fn mine(&mut self, txs: Vec<Transaction>) -> Block {
        let prev_blockhash = self.blocks.last().map_or(BlockHash::all_zeros(), Block::block_hash);
        let mut txdata = vec![self.coinbase()];
        txdata.extend(txs);
        let mut block = Block {
            header: Header {
                version: BlockVersion::from_consensus(0x2000_0000),
                prev_blockhash,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_700_000_000 + self.blocks.len() as u32 * 600,
                bits: CompactTarget::from_consensus(0x207f_ffff),
                nonce: u32::from(self.salt),
            },
            txdata,
        };
        if let Some(root) = block.compute_merkle_root() {
            block.header.merkle_root = root;
        }
        self.blocks.push(block.clone());
        block
    }

    /// A transaction spending `inputs` into one output of `value` paying
    /// to `p2pkh_script(tag)`.
    pub fn spend(&self, inputs: &[OutPoint], value: u64, tag: u8) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .iter()
                .map(|prev| TxIn {
                    previous_output: (*prev).into(),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut { value: Amount::from_sat(value), script_pubkey: p2pkh_script(tag) }],
        }
    }

    /// Regtest address of `p2pkh_script(tag)`.
    pub fn address_for(&self, tag: u8) -> String {
        Address::p2pkh(PubkeyHash::from_byte_array([tag; 20]), bitcoin::Network::Regtest).to_string()
    }
}

// ------------------------------------------------------------------
// MockChain
// ------------------------------------------------------------------

/// How [`MockChain`] answers `send_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPolicy {
    /// Accept and add to the mempool.
    #[default]
    AcceptAll,
    RejectAll,
}

#[derive(Default)]
struct MockState {
    blocks: Vec<Block>,
    known: HashMap<Hash256, Transaction>,
    mempool: Vec<Hash256>,
    failures: usize,
    send_policy: SendPolicy,
    sent: Vec<Hash256>,
    block_requests: Vec<u64>,
}

impl MockState {
    fn fail(&mut self) -> Result<(), SourceError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(SourceError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn index_block(&mut self, block: &Block) {
        for tx in &block.txdata {
            let txid = tx.id();
            self.mempool.retain(|t| *t != txid);
            self.known.insert(txid, tx.clone());
        }
    }
}

/// In-memory upstream node.
pub struct MockChain {
    state: Mutex<MockState>,
    events: broadcast::Sender<ChainEvent>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { state: Mutex::new(MockState::default()), events }
    }

    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let chain = Self::new();
        {
            let mut state = chain.state.lock();
            for block in &blocks {
                state.index_block(block);
            }
            state.blocks = blocks;
        }
        chain
    }

    /// Append a block and announce it.
    pub fn push_block(&self, block: Block) {
        {
            let mut state = self.state.lock();
            state.index_block(&block);
            state.blocks.push(block);
        }
        self.emit(ChainEvent::NewBlock);
    }

    /// Replace everything above `height` with `blocks` and announce it.
    pub fn reorg_to(&self, height: u64, blocks: Vec<Block>) {
        {
            let mut state = self.state.lock();
            state.blocks.truncate(height as usize + 1);
            for block in &blocks {
                state.index_block(block);
            }
            state.blocks.extend(blocks);
        }
        self.emit(ChainEvent::NewBlock);
    }

    /// Add a transaction to the mempool and announce it.
    pub fn add_mempool_tx(&self, tx: Transaction) -> Hash256 {
        let txid = tx.id();
        {
            let mut state = self.state.lock();
            state.known.insert(txid, tx);
            if !state.mempool.contains(&txid) {
                state.mempool.push(txid);
            }
        }
        self.emit(ChainEvent::NewTx(txid));
        txid
    }

    /// Make a transaction fetchable without putting it in the mempool.
    pub fn add_known_tx(&self, tx: Transaction) -> Hash256 {
        let txid = tx.id();
        self.state.lock().known.insert(txid, tx);
        txid
    }

    pub fn remove_mempool_tx(&self, txid: &Hash256) {
        self.state.lock().mempool.retain(|t| t != txid);
    }

    /// Fail the next `n` requests with [`SourceError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.state.lock().failures = n;
    }

    pub fn set_send_policy(&self, policy: SendPolicy) {
        self.state.lock().send_policy = policy;
    }

    /// Txids passed to `send_transaction`, accepted or not, in call order.
    pub fn sent_txids(&self) -> Vec<Hash256> {
        self.state.lock().sent.clone()
    }

    /// Heights requested through `block_at`, in call order.
    pub fn block_requests(&self) -> Vec<u64> {
        self.state.lock().block_requests.clone()
    }

    pub fn height(&self) -> Option<u64> {
        let len = self.state.lock().blocks.len();
        len.checked_sub(1).map(|h| h as u64)
    }

    pub fn emit(&self, event: ChainEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn latest_tip(&self) -> Result<ChainTip, SourceError> {
        let mut state = self.state.lock();
        state.fail()?;
        let block = state
            .blocks
            .last()
            .ok_or_else(|| SourceError::NotFound("empty chain".into()))?;
        Ok(ChainTip::new(state.blocks.len() as u64 - 1, block.id()))
    }

    async fn block_at(&self, height: u64) -> Result<Block, SourceError> {
        let mut state = self.state.lock();
        state.fail()?;
        state.block_requests.push(height);
        state
            .blocks
            .get(height as usize)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("block {height}")))
    }

    async fn transaction(&self, txid: &Hash256) -> Result<Transaction, SourceError> {
        let mut state = self.state.lock();
        state.fail()?;
        state
            .known
            .get(txid)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("transaction {txid}")))
    }

    async fn mempool_txids(&self) -> Result<Vec<Hash256>, SourceError> {
        let mut state = self.state.lock();
        state.fail()?;
        Ok(state.mempool.clone())
    }

    async fn send_transaction(&self, raw: &[u8]) -> Result<(), SourceError> {
        let tx: Transaction = deserialize(raw).map_err(DecodeError::from)?;
        let txid = tx.id();
        let mut state = self.state.lock();
        state.fail()?;
        state.sent.push(txid);
        match state.send_policy {
            SendPolicy::AcceptAll => {
                state.known.insert(txid, tx);
                if !state.mempool.contains(&txid) {
                    state.mempool.push(txid);
                }
                Ok(())
            }
            SendPolicy::RejectAll => Err(SourceError::Rejected(format!("{txid} rejected"))),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }
}

// ------------------------------------------------------------------
// RecordingNotifier
// ------------------------------------------------------------------

/// Notifier that keeps every delivered notification.
#[derive(Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<Notification>>,
    batches: Mutex<usize>,
}

impl RecordingNotifier {
    /// Drain everything delivered so far.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.delivered.lock())
    }

    /// Number of `deliver` calls, i.e. committed transactions that
    /// carried notifications.
    pub fn batches(&self) -> usize {
        *self.batches.lock()
    }
}

impl Notifier for RecordingNotifier {
    fn deliver(&self, notifications: &[Notification]) {
        self.delivered.lock().extend_from_slice(notifications);
        *self.batches.lock() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_links_blocks() {
        let mut chain = ChainBuilder::new();
        let b0 = chain.mine(vec![]);
        let b1 = chain.mine(vec![]);
        assert!(b0.prev_id().is_zero());
        assert_eq!(b1.prev_id(), b0.id());
        assert_eq!(chain.tip(), Some(ChainTip::new(1, b1.id())));
    }

    #[test]
    fn forks_diverge() {
        let mut chain = ChainBuilder::new();
        chain.mine(vec![]);
        let a = chain.mine(vec![]);
        let mut fork = chain.fork_at(0);
        let b = fork.mine(vec![]);
        assert_eq!(a.prev_id(), b.prev_id());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn address_for_is_regtest_p2pkh() {
        let address = ChainBuilder::new().address_for(1);
        assert!(address.starts_with('m') || address.starts_with('n'));
    }

    #[tokio::test]
    async fn mock_chain_failure_injection() {
        let mut builder = ChainBuilder::new();
        builder.mine(vec![]);
        let chain = MockChain::from_blocks(builder.blocks().to_vec());
        chain.fail_next(1);
        assert!(matches!(chain.latest_tip().await, Err(SourceError::Unavailable(_))));
        assert_eq!(chain.latest_tip().await.unwrap().height, 0);
    }

    #[tokio::test]
    async fn pushed_block_clears_mempool_entry() {
        let mut builder = ChainBuilder::new();
        let b0 = builder.mine(vec![]);
        let chain = MockChain::from_blocks(builder.blocks().to_vec());
        let mut events = chain.subscribe();

        let tx = builder.spend(&[OutPoint::new(b0.txdata[0].id(), 0)], 1, 1);
        let txid = chain.add_mempool_tx(tx.clone());
        assert_eq!(events.recv().await.unwrap(), ChainEvent::NewTx(txid));

        chain.push_block(builder.mine(vec![tx]));
        assert_eq!(events.recv().await.unwrap(), ChainEvent::NewBlock);
        assert!(chain.mempool_txids().await.unwrap().is_empty());
        assert_eq!(chain.transaction(&txid).await.unwrap().id(), txid);
    }
}
