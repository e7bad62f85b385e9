//! Applying one confirmed block to the index.

use std::collections::HashSet;

use bitcoin::consensus::encode::serialize;
use tracing::debug;

use tidemark_core::address::script_addresses;
use tidemark_core::constants::NetworkType;
use tidemark_core::error::StoreError;
use tidemark_core::index::{IndexTxn, InputRef};
use tidemark_core::notify::BlockRef;
use tidemark_core::types::{Block, BlockExt, Hash256, OutPoint, TransactionExt};

/// Result of applying a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBlock {
    pub hash: Hash256,
    pub height: u64,
    /// Txids in block order.
    pub txids: Vec<Hash256>,
    /// False when the block was already stored and nothing changed.
    pub inserted: bool,
}

/// Writes blocks, their transactions, outputs, inputs, and address rows.
#[derive(Debug, Clone)]
pub struct BlockImporter {
    network: NetworkType,
}

impl BlockImporter {
    pub fn new(network: NetworkType) -> Self {
        Self { network }
    }

    /// Keys an import of `block` must hold: every contained txid and every
    /// txid its inputs spend from.
    pub fn lock_keys(block: &Block) -> HashSet<Hash256> {
        let mut keys = HashSet::new();
        for tx in &block.txdata {
            keys.insert(tx.id());
            keys.extend(tx.parent_txids());
        }
        keys
    }

    /// Stage `block` at `height` on `txn`.
    ///
    /// Transactions already stored unconfirmed are confirmed in place; all
    /// others are inserted with their outputs. Notifications are staged
    /// only when `broadcast` is set. Re-applying a stored block is a no-op.
    pub fn apply(
        &self,
        txn: &mut IndexTxn<'_>,
        block: &Block,
        height: u64,
        broadcast: bool,
    ) -> Result<AppliedBlock, StoreError> {
        let hash = block.id();
        let txids = block.txids();
        let inserted = txn.insert_block(height, hash, serialize(&block.header), txids.clone())?;
        if !inserted {
            debug!(height, %hash, "block already indexed");
            return Ok(AppliedBlock { hash, height, txids, inserted });
        }

        let block_ref = Some(BlockRef { hash, height });
        if broadcast {
            txn.outbox().broadcast_block(hash, height);
            txn.outbox().add_block(hash);
        }

        let existing = txn.existing_txids(&txids)?;

        for (tx, txid) in block.txdata.iter().zip(&txids) {
            if existing.contains(txid) {
                txn.set_transaction_height(txid, Some(height))?;
                let touched = txn.set_outputs_height(txid, Some(height))?;
                if broadcast {
                    for (address, owner) in touched {
                        txn.outbox().broadcast_address(address, owner, block_ref);
                    }
                }
            } else {
                txn.insert_transaction(*txid, Some(height), serialize(tx))?;
                for (vout, output) in tx.output.iter().enumerate() {
                    let addresses = script_addresses(&output.script_pubkey, self.network);
                    let outpoint = OutPoint::new(*txid, vout as u32);
                    let linked = txn.insert_output(outpoint, output, addresses.clone(), Some(height))?;
                    if broadcast {
                        for address in &addresses {
                            txn.outbox().broadcast_address(address.clone(), *txid, block_ref);
                            for spender in &linked {
                                txn.outbox().broadcast_address(address.clone(), spender.txid, block_ref);
                            }
                        }
                    }
                }
            }
            if broadcast {
                txn.outbox().broadcast_tx(*txid, block_ref);
                txn.outbox().add_tx(*txid, true);
            }
        }

        // Inputs go last so spends of outputs created earlier in this
        // block link directly.
        for (tx, txid) in block.txdata.iter().zip(&txids) {
            let was_known = existing.contains(txid);
            for (vin, input) in tx.input.iter().enumerate() {
                if input.previous_output.is_null() {
                    continue;
                }
                let spender = InputRef { txid: *txid, vin: vin as u32 };
                let previous = OutPoint::from(input.previous_output);
                let addresses = if was_known {
                    txn.confirm_input(spender, previous, height)?
                } else {
                    txn.add_input(spender, previous, Some(height))?
                };
                if broadcast {
                    for address in addresses {
                        txn.outbox().broadcast_address(address, *txid, block_ref);
                    }
                }
            }
        }

        Ok(AppliedBlock { hash, height, txids, inserted })
    }
}
