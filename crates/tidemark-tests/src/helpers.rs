//! Shared fixtures for the end-to-end tests.

use std::sync::Arc;

use tidemark_core::index::Index;
use tidemark_core::store::MemoryStore;
use tidemark_core::types::{Block, OutPoint, Transaction, TransactionExt};
use tidemark_sync::testing::{ChainBuilder, MockChain, RecordingNotifier, fast_sync_config};
use tidemark_sync::{SyncConfig, SyncEngine};

/// An engine wired to in-memory storage, upstream, and notifier.
pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub store: Arc<MemoryStore>,
    pub source: Arc<MockChain>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    /// Engine following `chain`, with nothing indexed yet.
    pub fn new(chain: &ChainBuilder) -> Self {
        Self::with_config(chain, fast_sync_config())
    }

    pub fn with_config(chain: &ChainBuilder, config: SyncConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let index = Index::new(store.clone(), notifier.clone());
        let source = Arc::new(MockChain::from_blocks(chain.blocks().to_vec()));
        let engine = SyncEngine::new(index, source.clone(), config);
        Self { engine, store, source, notifier }
    }

    pub fn index(&self) -> &Index {
        self.engine.index()
    }
}

/// A chain of `len` coinbase-only blocks.
pub fn empty_chain(len: usize) -> ChainBuilder {
    let mut chain = ChainBuilder::new();
    for _ in 0..len {
        chain.mine(vec![]);
    }
    chain
}

/// The first output of the coinbase in `block`.
pub fn coinbase_output(block: &Block) -> OutPoint {
    OutPoint::new(block.txdata[0].id(), 0)
}

/// Output `vout` of `tx`.
pub fn output_of(tx: &Transaction, vout: u32) -> OutPoint {
    OutPoint::new(tx.id(), vout)
}

/// Mine `count` blocks on `chain`, each holding one spend of the previous
/// block's coinbase paying to `tag`. Mines a funding block first if the
/// chain is empty.
pub fn mine_spends(chain: &mut ChainBuilder, count: usize, tag: u8) -> Vec<Transaction> {
    if chain.blocks().is_empty() {
        chain.mine(vec![]);
    }
    let mut spends = Vec::with_capacity(count);
    for _ in 0..count {
        let funding = chain.blocks().last().map(coinbase_output).unwrap_or_else(OutPoint::null);
        let spend = chain.spend(&[funding], 1_000, tag);
        chain.mine(vec![spend.clone()]);
        spends.push(spend);
    }
    spends
}
