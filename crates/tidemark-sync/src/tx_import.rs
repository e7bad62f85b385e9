//! Applying one unconfirmed transaction to the index.

use bitcoin::consensus::encode::serialize;

use tidemark_core::address::script_addresses;
use tidemark_core::constants::NetworkType;
use tidemark_core::error::StoreError;
use tidemark_core::index::{IndexTxn, InputRef};
use tidemark_core::types::{Hash256, OutPoint, Transaction, TransactionExt};

/// Outcome of an unconfirmed-transaction import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxImport {
    /// Stored as a new unconfirmed transaction.
    Imported,
    /// Already indexed, confirmed or not. Nothing changed.
    AlreadyKnown,
    /// Some parents are not indexed yet; nothing was written.
    Deferred(Vec<Hash256>),
}

/// Writes unconfirmed transactions with their inputs and outputs.
#[derive(Debug, Clone)]
pub struct TxImporter {
    network: NetworkType,
}

impl TxImporter {
    pub fn new(network: NetworkType) -> Self {
        Self { network }
    }

    /// Stage `tx` as unconfirmed on `txn`, unless it is known or waits on
    /// missing parents.
    pub fn apply(&self, txn: &mut IndexTxn<'_>, tx: &Transaction) -> Result<TxImport, StoreError> {
        let txid = tx.id();
        if txn.tx_exists(&txid)? {
            return Ok(TxImport::AlreadyKnown);
        }

        let mut missing = Vec::new();
        for parent in tx.parent_txids() {
            if !txn.tx_exists(&parent)? {
                missing.push(parent);
            }
        }
        if !missing.is_empty() {
            return Ok(TxImport::Deferred(missing));
        }

        txn.insert_transaction(txid, None, serialize(tx))?;
        txn.outbox().broadcast_tx(txid, None);
        txn.outbox().add_tx(txid, false);

        for (vin, input) in tx.input.iter().enumerate() {
            if input.previous_output.is_null() {
                continue;
            }
            let spender = InputRef { txid, vin: vin as u32 };
            for address in txn.add_input(spender, input.previous_output.into(), None)? {
                txn.outbox().broadcast_address(address, txid, None);
            }
        }

        for (vout, output) in tx.output.iter().enumerate() {
            let addresses = script_addresses(&output.script_pubkey, self.network);
            let linked = txn.insert_output(OutPoint::new(txid, vout as u32), output, addresses.clone(), None)?;
            for address in addresses {
                for spender in &linked {
                    txn.outbox().broadcast_address(address.clone(), spender.txid, None);
                }
                txn.outbox().broadcast_address(address, txid, None);
            }
        }

        Ok(TxImport::Imported)
    }
}
