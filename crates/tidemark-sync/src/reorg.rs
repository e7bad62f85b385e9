//! Fork detection and rollback of divergent local history.

use tracing::debug;

use tidemark_core::error::{StoreError, SyncError};
use tidemark_core::index::{Index, IndexTxn};
use tidemark_core::traits::ChainSource;
use tidemark_core::types::{BlockExt, Hash256};

/// What a rollback removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rollback {
    pub removed_blocks: Vec<Hash256>,
    pub unconfirmed_txids: Vec<Hash256>,
    /// `(address, txid)` pairs whose confirmation status changed.
    pub touched_addresses: Vec<(String, Hash256)>,
}

/// Finds the common ancestor of the local and external chains and rolls
/// local state back to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReorgHandler;

impl ReorgHandler {
    /// Walk back from `start` until the external block at some height
    /// builds on the local block one below it.
    ///
    /// Returns the fork height: the highest local block both chains share,
    /// or `None` when not even the local genesis block is shared.
    pub async fn find_fork(
        &self,
        index: &Index,
        source: &dyn ChainSource,
        start: u64,
    ) -> Result<Option<u64>, SyncError> {
        let mut height = start;
        loop {
            let external = source.block_at(height).await?;
            if index.block_at(height)?.is_some_and(|row| row.hash == external.id()) {
                return Ok(Some(height));
            }
            let local_prev = match height.checked_sub(1) {
                Some(below) => index.block_at(below)?.map(|row| row.hash),
                None => Some(Hash256::ZERO),
            };
            debug!(height, "comparing external block with local history");
            if local_prev == Some(external.prev_id()) {
                return Ok(height.checked_sub(1));
            }
            match height.checked_sub(1) {
                Some(below) => height = below,
                None => return Ok(None),
            }
        }
    }

    /// Stage the rollback of everything above `fork` on `txn`: delete the
    /// blocks and unconfirm their transactions, outputs, and inputs.
    pub fn rollback(&self, txn: &mut IndexTxn<'_>, fork: Option<u64>) -> Result<Rollback, StoreError> {
        let removed_blocks = txn.delete_blocks_above(fork)?;
        for hash in &removed_blocks {
            txn.outbox().remove_block(*hash);
        }

        let unconfirmed_txids = txn.unconfirm_transactions_above(fork)?;
        for txid in &unconfirmed_txids {
            txn.outbox().broadcast_tx(*txid, None);
        }

        let mut touched_addresses = txn.unconfirm_outputs_above(fork)?;
        touched_addresses.extend(txn.unconfirm_inputs_above(fork)?);
        for (address, txid) in &touched_addresses {
            txn.outbox().broadcast_address(address.clone(), *txid, None);
        }

        Ok(Rollback { removed_blocks, unconfirmed_txids, touched_addresses })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidemark_core::constants::NetworkType;
    use tidemark_core::index::InputRef;
    use tidemark_core::notify::Notification;
    use tidemark_core::store::MemoryStore;
    use tidemark_core::types::{OutPoint, TransactionExt};

    use crate::block_import::BlockImporter;
    use crate::testing::{ChainBuilder, MockChain, RecordingNotifier};

    fn indexed(chain: &ChainBuilder) -> (Index, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let index = Index::new(Arc::new(MemoryStore::new()), notifier.clone());
        let importer = BlockImporter::new(NetworkType::Regtest);
        for (height, block) in chain.blocks().iter().enumerate() {
            let mut txn = index.begin();
            importer.apply(&mut txn, block, height as u64, false).unwrap();
            txn.commit().unwrap();
        }
        (index, notifier)
    }

    #[tokio::test]
    async fn finds_fork_below_divergence() {
        let mut local = ChainBuilder::new();
        for _ in 0..11 {
            local.mine(vec![]);
        }
        let (index, _) = indexed(&local);

        let mut external = local.fork_at(8);
        for _ in 0..3 {
            external.mine(vec![]);
        }
        let source = MockChain::from_blocks(external.blocks().to_vec());

        let fork = ReorgHandler.find_fork(&index, &source, 10).await.unwrap();
        assert_eq!(fork, Some(8));
    }

    #[tokio::test]
    async fn disjoint_chains_fork_below_genesis() {
        let mut local = ChainBuilder::new();
        local.mine(vec![]);
        local.mine(vec![]);
        let (index, _) = indexed(&local);

        let mut external = ChainBuilder::with_salt(9);
        external.mine(vec![]);
        external.mine(vec![]);
        let source = MockChain::from_blocks(external.blocks().to_vec());

        assert_eq!(ReorgHandler.find_fork(&index, &source, 1).await.unwrap(), None);
    }

    #[test]
    fn rollback_unconfirms_everything_above_fork() {
        let mut chain = ChainBuilder::new();
        let b0 = chain.mine(vec![]);
        let funding = OutPoint::new(b0.txdata[0].id(), 0);
        let spend = chain.spend(&[funding], 700, 2);
        let b1 = chain.mine(vec![spend.clone()]);
        let b2 = chain.mine(vec![]);
        let (index, notifier) = indexed(&chain);

        let mut txn = index.begin();
        let rollback = ReorgHandler.rollback(&mut txn, Some(0)).unwrap();
        txn.commit().unwrap();

        assert_eq!(rollback.removed_blocks, vec![b1.id(), b2.id()]);
        assert_eq!(index.tip().unwrap().unwrap().hash, b0.id());
        assert!(index.block_at(1).unwrap().is_none());

        let txn = index.begin();
        assert_eq!(txn.transaction(&spend.id()).unwrap().unwrap().height, None);
        assert_eq!(txn.output(&OutPoint::new(spend.id(), 0)).unwrap().unwrap().height, None);
        assert_eq!(txn.input(&InputRef { txid: spend.id(), vin: 0 }).unwrap().unwrap().height, None);
        // The funding output stays confirmed but is still spent.
        let funding_row = txn.output(&funding).unwrap().unwrap();
        assert_eq!(funding_row.height, Some(0));
        assert!(funding_row.spent_by.is_some());

        let sent = notifier.take();
        assert!(sent.contains(&Notification::RemoveBlock { hash: b2.id() }));
        assert!(sent.contains(&Notification::BroadcastTx { txid: spend.id(), block: None }));
        let mut unconfirmed = index.unconfirmed_txids().unwrap();
        unconfirmed.sort();
        let mut expected = vec![spend.id(), b1.txdata[0].id(), b2.txdata[0].id()];
        expected.sort();
        assert_eq!(unconfirmed, expected);
    }
}
