//! The address/transaction index and its transactional row operations.
//!
//! [`Index`] wraps a [`KvStore`] and a [`Notifier`]. All mutations go
//! through an [`IndexTxn`]: writes are staged in an overlay that reads see
//! immediately, and [`IndexTxn::commit`] applies them as one atomic batch
//! before releasing the staged notifications. Dropping an uncommitted
//! transaction discards both.
//!
//! Every stored row is bincode-encoded. Keys are built so that big-endian
//! heights sort numerically, which lets "everything above height H" be a
//! single ordered scan.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use bincode::{Decode, Encode};
use bitcoin::TxOut;
use serde::Serialize;

use crate::error::StoreError;
use crate::notify::Outbox;
use crate::store::{Column, KvPairs, KvStore, WriteBatch};
use crate::traits::Notifier;
use crate::types::{ChainTip, Hash256, OutPoint};

// --- Rows ---

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlockRow {
    pub hash: Hash256,
    /// Raw 80-byte header.
    pub header: Vec<u8>,
    pub txids: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TxRow {
    /// Confirmation height; `None` while unconfirmed.
    pub height: Option<u64>,
    /// Consensus-serialized transaction.
    pub raw: Vec<u8>,
}

/// Identifies one input of a spending transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Serialize)]
pub struct InputRef {
    pub txid: Hash256,
    pub vin: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct OutputRow {
    pub value: u64,
    pub script: Vec<u8>,
    pub addresses: Vec<String>,
    pub height: Option<u64>,
    /// The input currently spending this output, if known.
    pub spent_by: Option<InputRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct InputRow {
    pub previous_output: OutPoint,
    /// False while the referenced output has not been indexed.
    pub linked: bool,
    pub height: Option<u64>,
}

/// One output received by an address, with its spending status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub output: OutPoint,
    pub value: u64,
    pub height: Option<u64>,
    pub spent_by: Option<InputRef>,
    pub spent_height: Option<u64>,
}

// --- Keys ---

mod keys {
    use super::*;

    pub const TIP: &[u8] = b"tip";

    pub fn height(h: u64) -> [u8; 8] {
        h.to_be_bytes()
    }

    /// First height strictly above `fork`; the whole column when `fork` is `None`.
    pub fn above(fork: Option<u64>) -> Vec<u8> {
        match fork {
            Some(h) => match h.checked_add(1) {
                Some(next) => next.to_be_bytes().to_vec(),
                None => vec![0xFF; 9],
            },
            None => Vec::new(),
        }
    }

    pub fn outpoint(txid: &Hash256, n: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(36);
        key.extend_from_slice(txid.as_bytes());
        key.extend_from_slice(&n.to_be_bytes());
        key
    }

    pub fn height_txid(h: u64, txid: &Hash256) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(&h.to_be_bytes());
        key.extend_from_slice(txid.as_bytes());
        key
    }

    pub fn height_outpoint(h: u64, txid: &Hash256, n: u32) -> Vec<u8> {
        let mut key = height_txid(h, txid);
        key.extend_from_slice(&n.to_be_bytes());
        key
    }

    pub fn unlinked(prev: &OutPoint, spender: &InputRef) -> Vec<u8> {
        let mut key = outpoint(&prev.txid, prev.vout);
        key.extend_from_slice(&outpoint(&spender.txid, spender.vin));
        key
    }

    pub fn address_prefix(address: &str) -> Vec<u8> {
        let bytes = address.as_bytes();
        let mut key = Vec::with_capacity(1 + bytes.len() + 36);
        // Addresses are at most 90 characters; the length byte keeps one
        // address from being a prefix of another.
        key.push(bytes.len().min(u8::MAX as usize) as u8);
        key.extend_from_slice(bytes);
        key
    }

    pub fn address_output(address: &str, txid: &Hash256, n: u32) -> Vec<u8> {
        let mut key = address_prefix(address);
        key.extend_from_slice(&outpoint(txid, n));
        key
    }

    pub fn hash_at(column: Column, key: &[u8], at: usize) -> Result<Hash256, StoreError> {
        key.get(at..at + 32)
            .and_then(Hash256::from_slice)
            .ok_or_else(|| corrupt(column, "short key"))
    }

    pub fn u32_at(column: Column, key: &[u8], at: usize) -> Result<u32, StoreError> {
        key.get(at..at + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_be_bytes)
            .ok_or_else(|| corrupt(column, "short key"))
    }

    pub fn u64_at(column: Column, key: &[u8], at: usize) -> Result<u64, StoreError> {
        key.get(at..at + 8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| corrupt(column, "short key"))
    }

    pub fn corrupt(column: Column, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt { column: column.name(), reason: reason.into() }
    }
}

fn encode_row<T: Encode>(row: &T) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(row, bincode::config::standard())
        .map_err(|e| StoreError::Backend(e.to_string()))
}

fn decode_row<T: Decode<()>>(column: Column, bytes: &[u8]) -> Result<T, StoreError> {
    let (row, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| keys::corrupt(column, e.to_string()))?;
    Ok(row)
}

// --- Index ---

/// Handle to the index. Cheap to clone.
#[derive(Clone)]
pub struct Index {
    store: Arc<dyn KvStore>,
    notifier: Arc<dyn Notifier>,
}

impl Index {
    pub fn new(store: Arc<dyn KvStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Open a storage transaction.
    pub fn begin(&self) -> IndexTxn<'_> {
        IndexTxn {
            index: self,
            staged: BTreeMap::new(),
            outbox: Outbox::default(),
        }
    }

    /// Highest stored block, or `None` for an empty index.
    pub fn tip(&self) -> Result<Option<ChainTip>, StoreError> {
        self.begin().tip()
    }

    pub fn block_at(&self, height: u64) -> Result<Option<BlockRow>, StoreError> {
        self.begin().block_at(height)
    }

    pub fn block_height(&self, hash: &Hash256) -> Result<Option<u64>, StoreError> {
        self.begin().block_height(hash)
    }

    pub fn transaction(&self, txid: &Hash256) -> Result<Option<TxRow>, StoreError> {
        self.begin().transaction(txid)
    }

    pub fn unconfirmed_txids(&self) -> Result<Vec<Hash256>, StoreError> {
        self.begin().unconfirmed_txids()
    }

    /// Every output ever received by `address`, oldest key first.
    pub fn address_history(&self, address: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let txn = self.begin();
        let mut entries = Vec::new();
        for (output, row) in txn.address_outputs(address)? {
            let spent_height = match row.spent_by {
                Some(spender) => txn.input(&spender)?.and_then(|input| input.height),
                None => None,
            };
            entries.push(HistoryEntry {
                output,
                value: row.value,
                height: row.height,
                spent_by: row.spent_by,
                spent_height,
            });
        }
        Ok(entries)
    }

    /// Outputs received by `address` that no indexed input spends.
    pub fn address_unspent(&self, address: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut entries = self.address_history(address)?;
        entries.retain(|e| e.spent_by.is_none());
        Ok(entries)
    }
}

/// An open storage transaction over the [`Index`].
pub struct IndexTxn<'a> {
    index: &'a Index,
    staged: BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>,
    outbox: Outbox,
}

impl IndexTxn<'_> {
    /// Notifications to publish if this transaction commits.
    pub fn outbox(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    /// Number of staged key mutations.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Apply all staged writes atomically, then publish staged notifications.
    pub fn commit(self) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for ((column, key), value) in self.staged {
            match value {
                Some(value) => batch.put(column, key, value),
                None => batch.delete(column, key),
            }
        }
        if !batch.is_empty() {
            self.index.store.write(batch)?;
        }
        let notifications = self.outbox.into_inner();
        if !notifications.is_empty() {
            self.index.notifier.deliver(&notifications);
        }
        Ok(())
    }

    // --- Overlay primitives ---

    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.staged.get(&(column, key.to_vec())) {
            Some(staged) => Ok(staged.clone()),
            None => self.index.store.get(column, key),
        }
    }

    fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.staged.insert((column, key.into()), Some(value));
    }

    fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.staged.insert((column, key.into()), None);
    }

    fn exists(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(column, key)?.is_some())
    }

    fn get_row<T: Decode<()>>(&self, column: Column, key: &[u8]) -> Result<Option<T>, StoreError> {
        self.get(column, key)?
            .map(|bytes| decode_row(column, &bytes))
            .transpose()
    }

    fn put_row<T: Encode>(&mut self, column: Column, key: impl Into<Vec<u8>>, row: &T) -> Result<(), StoreError> {
        let value = encode_row(row)?;
        self.put(column, key, value);
        Ok(())
    }

    /// Merge staged writes over a backend scan result.
    fn overlay(
        &self,
        column: Column,
        base: KvPairs,
        start: &[u8],
        prefix: Option<&[u8]>,
    ) -> KvPairs {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = base.into_iter().collect();
        let range = (Bound::Included((column, start.to_vec())), Bound::Unbounded);
        for ((col, key), value) in self.staged.range(range) {
            if *col != column || prefix.is_some_and(|p| !key.starts_with(p)) {
                break;
            }
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        merged.into_iter().collect()
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<KvPairs, StoreError> {
        let base = self.index.store.scan_prefix(column, prefix)?;
        Ok(self.overlay(column, base, prefix, Some(prefix)))
    }

    fn scan_from(&self, column: Column, start: &[u8]) -> Result<KvPairs, StoreError> {
        let base = self.index.store.scan_from(column, start)?;
        Ok(self.overlay(column, base, start, None))
    }

    // --- Tip & blocks ---

    pub fn tip(&self) -> Result<Option<ChainTip>, StoreError> {
        self.get_row(Column::Meta, keys::TIP)
    }

    fn set_tip(&mut self, tip: Option<ChainTip>) -> Result<(), StoreError> {
        match tip {
            Some(tip) => self.put_row(Column::Meta, keys::TIP, &tip),
            None => {
                self.delete(Column::Meta, keys::TIP);
                Ok(())
            }
        }
    }

    pub fn block_at(&self, height: u64) -> Result<Option<BlockRow>, StoreError> {
        self.get_row(Column::Blocks, &keys::height(height))
    }

    pub fn block_height(&self, hash: &Hash256) -> Result<Option<u64>, StoreError> {
        self.get_row(Column::BlockHashes, hash.as_bytes())
    }

    /// Store a block row and advance the tip if this block is higher.
    ///
    /// Re-inserting the same block is a no-op returning `false`; a different
    /// hash at an occupied height is a conflict.
    pub fn insert_block(
        &mut self,
        height: u64,
        hash: Hash256,
        header: Vec<u8>,
        txids: Vec<Hash256>,
    ) -> Result<bool, StoreError> {
        if let Some(existing) = self.block_at(height)? {
            if existing.hash == hash {
                return Ok(false);
            }
            return Err(StoreError::BlockConflict { height, existing: existing.hash.to_string() });
        }
        self.put_row(Column::Blocks, keys::height(height), &BlockRow { hash, header, txids })?;
        self.put_row(Column::BlockHashes, *hash.as_bytes(), &height)?;
        if self.tip()?.is_none_or(|tip| height > tip.height) {
            self.set_tip(Some(ChainTip::new(height, hash)))?;
        }
        Ok(true)
    }

    /// Delete every block above `fork` and reset the tip to the block at
    /// `fork` (or to empty). Returns the deleted hashes, lowest first.
    pub fn delete_blocks_above(&mut self, fork: Option<u64>) -> Result<Vec<Hash256>, StoreError> {
        let mut removed = Vec::new();
        for (key, value) in self.scan_from(Column::Blocks, &keys::above(fork))? {
            let row: BlockRow = decode_row(Column::Blocks, &value)?;
            self.delete(Column::Blocks, key);
            self.delete(Column::BlockHashes, *row.hash.as_bytes());
            removed.push(row.hash);
        }
        let tip = match fork {
            Some(h) => self.block_at(h)?.map(|row| ChainTip::new(h, row.hash)),
            None => None,
        };
        self.set_tip(tip)?;
        Ok(removed)
    }

    // --- Transactions ---

    pub fn transaction(&self, txid: &Hash256) -> Result<Option<TxRow>, StoreError> {
        self.get_row(Column::Txs, txid.as_bytes())
    }

    pub fn tx_exists(&self, txid: &Hash256) -> Result<bool, StoreError> {
        self.exists(Column::Txs, txid.as_bytes())
    }

    /// The subset of `txids` already stored.
    pub fn existing_txids(&self, txids: &[Hash256]) -> Result<HashSet<Hash256>, StoreError> {
        let mut found = HashSet::new();
        for txid in txids {
            if self.tx_exists(txid)? {
                found.insert(*txid);
            }
        }
        Ok(found)
    }

    pub fn insert_transaction(&mut self, txid: Hash256, height: Option<u64>, raw: Vec<u8>) -> Result<(), StoreError> {
        self.put_row(Column::Txs, *txid.as_bytes(), &TxRow { height, raw })?;
        self.index_tx_height(&txid, None, height);
        Ok(())
    }

    fn index_tx_height(&mut self, txid: &Hash256, old: Option<u64>, new: Option<u64>) {
        match old {
            Some(h) => self.delete(Column::TxHeights, keys::height_txid(h, txid)),
            None => self.delete(Column::Mempool, *txid.as_bytes()),
        }
        match new {
            Some(h) => self.put(Column::TxHeights, keys::height_txid(h, txid), Vec::new()),
            None => self.put(Column::Mempool, *txid.as_bytes(), Vec::new()),
        }
    }

    /// Set or clear a stored transaction's confirmation height.
    pub fn set_transaction_height(&mut self, txid: &Hash256, height: Option<u64>) -> Result<(), StoreError> {
        let mut row = self
            .transaction(txid)?
            .ok_or_else(|| StoreError::MissingTransaction(txid.to_string()))?;
        let old = row.height;
        row.height = height;
        self.put_row(Column::Txs, *txid.as_bytes(), &row)?;
        self.index_tx_height(txid, old, height);
        Ok(())
    }

    /// Unconfirm every transaction above `fork`. Returns their txids.
    pub fn unconfirm_transactions_above(&mut self, fork: Option<u64>) -> Result<Vec<Hash256>, StoreError> {
        let mut txids = Vec::new();
        for (key, _) in self.scan_from(Column::TxHeights, &keys::above(fork))? {
            let txid = keys::hash_at(Column::TxHeights, &key, 8)?;
            self.set_transaction_height(&txid, None)?;
            txids.push(txid);
        }
        Ok(txids)
    }

    pub fn unconfirmed_txids(&self) -> Result<Vec<Hash256>, StoreError> {
        self.scan_prefix(Column::Mempool, &[])?
            .into_iter()
            .map(|(key, _)| keys::hash_at(Column::Mempool, &key, 0))
            .collect()
    }

    /// Raw bytes of those `txids` that are stored, in request order.
    pub fn raw_transactions(&self, txids: &[Hash256]) -> Result<Vec<(Hash256, Vec<u8>)>, StoreError> {
        let mut out = Vec::with_capacity(txids.len());
        for txid in txids {
            if let Some(row) = self.transaction(txid)? {
                out.push((*txid, row.raw));
            }
        }
        Ok(out)
    }

    // --- Outputs ---

    pub fn output(&self, outpoint: &OutPoint) -> Result<Option<OutputRow>, StoreError> {
        self.get_row(Column::Outputs, &keys::outpoint(&outpoint.txid, outpoint.vout))
    }

    fn outputs_of(&self, txid: &Hash256) -> Result<Vec<(OutPoint, OutputRow)>, StoreError> {
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix(Column::Outputs, txid.as_bytes())? {
            let vout = keys::u32_at(Column::Outputs, &key, 32)?;
            out.push((OutPoint::new(*txid, vout), decode_row(Column::Outputs, &value)?));
        }
        Ok(out)
    }

    /// Index a new output and its addresses.
    ///
    /// Inputs recorded earlier against this outpoint while it was unknown
    /// are linked to it now; their references are returned. Re-inserting an
    /// existing output changes nothing.
    pub fn insert_output(
        &mut self,
        outpoint: OutPoint,
        output: &TxOut,
        addresses: Vec<String>,
        height: Option<u64>,
    ) -> Result<Vec<InputRef>, StoreError> {
        let key = keys::outpoint(&outpoint.txid, outpoint.vout);
        if self.exists(Column::Outputs, &key)? {
            return Ok(Vec::new());
        }

        for address in &addresses {
            self.put(
                Column::AddressOutputs,
                keys::address_output(address, &outpoint.txid, outpoint.vout),
                Vec::new(),
            );
        }
        if let Some(h) = height {
            self.put(
                Column::OutputHeights,
                keys::height_outpoint(h, &outpoint.txid, outpoint.vout),
                Vec::new(),
            );
        }

        let mut row = OutputRow {
            value: output.value.to_sat(),
            script: output.script_pubkey.to_bytes(),
            addresses,
            height,
            spent_by: None,
        };

        // Fix up inputs that arrived before this output.
        let mut linked = Vec::new();
        for (unlinked_key, _) in self.scan_prefix(Column::Unlinked, &key)? {
            let spender = InputRef {
                txid: keys::hash_at(Column::Unlinked, &unlinked_key, 36)?,
                vin: keys::u32_at(Column::Unlinked, &unlinked_key, 68)?,
            };
            self.delete(Column::Unlinked, unlinked_key);
            let input_key = keys::outpoint(&spender.txid, spender.vin);
            if let Some(mut input) = self.get_row::<InputRow>(Column::Inputs, &input_key)? {
                input.linked = true;
                self.put_row(Column::Inputs, input_key, &input)?;
            }
            row.spent_by = Some(spender);
            linked.push(spender);
        }

        self.put_row(Column::Outputs, key, &row)?;
        Ok(linked)
    }

    /// Set the confirmation height of every output of `txid`.
    /// Returns `(address, txid)` for every address touched.
    pub fn set_outputs_height(
        &mut self,
        txid: &Hash256,
        height: Option<u64>,
    ) -> Result<Vec<(String, Hash256)>, StoreError> {
        let mut touched = Vec::new();
        for (outpoint, mut row) in self.outputs_of(txid)? {
            self.reindex_output_height(&outpoint, row.height, height);
            row.height = height;
            touched.extend(row.addresses.iter().map(|a| (a.clone(), *txid)));
            self.put_row(Column::Outputs, keys::outpoint(txid, outpoint.vout), &row)?;
        }
        Ok(touched)
    }

    fn reindex_output_height(&mut self, outpoint: &OutPoint, old: Option<u64>, new: Option<u64>) {
        if let Some(h) = old {
            self.delete(Column::OutputHeights, keys::height_outpoint(h, &outpoint.txid, outpoint.vout));
        }
        if let Some(h) = new {
            self.put(Column::OutputHeights, keys::height_outpoint(h, &outpoint.txid, outpoint.vout), Vec::new());
        }
    }

    /// Clear the height of every output confirmed above `fork`.
    /// Returns `(address, owning txid)` pairs.
    pub fn unconfirm_outputs_above(&mut self, fork: Option<u64>) -> Result<Vec<(String, Hash256)>, StoreError> {
        let mut touched = Vec::new();
        for (key, _) in self.scan_from(Column::OutputHeights, &keys::above(fork))? {
            let txid = keys::hash_at(Column::OutputHeights, &key, 8)?;
            let vout = keys::u32_at(Column::OutputHeights, &key, 40)?;
            self.delete(Column::OutputHeights, key);
            let row_key = keys::outpoint(&txid, vout);
            if let Some(mut row) = self.get_row::<OutputRow>(Column::Outputs, &row_key)? {
                row.height = None;
                touched.extend(row.addresses.iter().map(|a| (a.clone(), txid)));
                self.put_row(Column::Outputs, row_key, &row)?;
            }
        }
        Ok(touched)
    }

    /// Outputs indexed under `address`.
    pub fn address_outputs(&self, address: &str) -> Result<Vec<(OutPoint, OutputRow)>, StoreError> {
        let prefix = keys::address_prefix(address);
        let mut out = Vec::new();
        for (key, _) in self.scan_prefix(Column::AddressOutputs, &prefix)? {
            let txid = keys::hash_at(Column::AddressOutputs, &key, prefix.len())?;
            let vout = keys::u32_at(Column::AddressOutputs, &key, prefix.len() + 32)?;
            let outpoint = OutPoint::new(txid, vout);
            if let Some(row) = self.output(&outpoint)? {
                out.push((outpoint, row));
            }
        }
        Ok(out)
    }

    // --- Inputs ---

    pub fn input(&self, spender: &InputRef) -> Result<Option<InputRow>, StoreError> {
        self.get_row(Column::Inputs, &keys::outpoint(&spender.txid, spender.vin))
    }

    /// Record an input of a newly stored transaction and link it to the
    /// output it spends. Returns the spent output's addresses, or nothing
    /// if that output is not indexed yet (the input is then kept as
    /// unlinked until [`insert_output`](Self::insert_output) sees it).
    pub fn add_input(
        &mut self,
        spender: InputRef,
        previous_output: OutPoint,
        height: Option<u64>,
    ) -> Result<Vec<String>, StoreError> {
        if let Some(h) = height {
            self.put(Column::InputHeights, keys::height_outpoint(h, &spender.txid, spender.vin), Vec::new());
        }
        let mut row = InputRow { previous_output, linked: false, height };
        let addresses = self.link_input(spender, &mut row)?;
        self.put_row(Column::Inputs, keys::outpoint(&spender.txid, spender.vin), &row)?;
        Ok(addresses)
    }

    /// Confirm an input of a transaction that was already stored
    /// unconfirmed. Falls back to [`add_input`](Self::add_input) when the
    /// input row is missing.
    pub fn confirm_input(
        &mut self,
        spender: InputRef,
        previous_output: OutPoint,
        height: u64,
    ) -> Result<Vec<String>, StoreError> {
        let key = keys::outpoint(&spender.txid, spender.vin);
        let Some(mut row) = self.get_row::<InputRow>(Column::Inputs, &key)? else {
            return self.add_input(spender, previous_output, Some(height));
        };
        if let Some(old) = row.height {
            self.delete(Column::InputHeights, keys::height_outpoint(old, &spender.txid, spender.vin));
        }
        self.put(Column::InputHeights, keys::height_outpoint(height, &spender.txid, spender.vin), Vec::new());
        row.height = Some(height);
        let addresses = self.link_input(spender, &mut row)?;
        self.put_row(Column::Inputs, key, &row)?;
        Ok(addresses)
    }

    fn link_input(&mut self, spender: InputRef, row: &mut InputRow) -> Result<Vec<String>, StoreError> {
        let prev = row.previous_output;
        let output_key = keys::outpoint(&prev.txid, prev.vout);
        match self.get_row::<OutputRow>(Column::Outputs, &output_key)? {
            Some(mut output) => {
                if output.spent_by != Some(spender) {
                    output.spent_by = Some(spender);
                    self.put_row(Column::Outputs, output_key, &output)?;
                }
                if !row.linked {
                    self.delete(Column::Unlinked, keys::unlinked(&prev, &spender));
                    row.linked = true;
                }
                Ok(output.addresses)
            }
            None => {
                self.put(Column::Unlinked, keys::unlinked(&prev, &spender), Vec::new());
                row.linked = false;
                Ok(Vec::new())
            }
        }
    }

    /// Clear the height of every input confirmed above `fork`. Returns
    /// `(address of spent output, spending txid)` pairs.
    pub fn unconfirm_inputs_above(&mut self, fork: Option<u64>) -> Result<Vec<(String, Hash256)>, StoreError> {
        let mut touched = Vec::new();
        for (key, _) in self.scan_from(Column::InputHeights, &keys::above(fork))? {
            let spender = InputRef {
                txid: keys::hash_at(Column::InputHeights, &key, 8)?,
                vin: keys::u32_at(Column::InputHeights, &key, 40)?,
            };
            self.delete(Column::InputHeights, key);
            let row_key = keys::outpoint(&spender.txid, spender.vin);
            let Some(mut row) = self.get_row::<InputRow>(Column::Inputs, &row_key)? else {
                continue;
            };
            row.height = None;
            if row.linked {
                if let Some(output) = self.output(&row.previous_output)? {
                    touched.extend(output.addresses.into_iter().map(|a| (a, spender.txid)));
                }
            }
            self.put_row(Column::Inputs, row_key, &row)?;
        }
        Ok(touched)
    }

    // --- Removal ---

    /// Delete an unconfirmed transaction with its outputs, inputs, and
    /// address rows.
    ///
    /// Returns `None` if the transaction is absent or confirmed. Otherwise
    /// returns the txids of transactions that spent its outputs; those
    /// inputs become unlinked.
    pub fn remove_unconfirmed(&mut self, txid: &Hash256) -> Result<Option<Vec<Hash256>>, StoreError> {
        match self.transaction(txid)? {
            Some(row) if row.height.is_none() => {}
            _ => return Ok(None),
        }
        self.delete(Column::Txs, *txid.as_bytes());
        self.delete(Column::Mempool, *txid.as_bytes());

        let mut dependents = Vec::new();
        for (outpoint, row) in self.outputs_of(txid)? {
            for address in &row.addresses {
                self.delete(Column::AddressOutputs, keys::address_output(address, txid, outpoint.vout));
            }
            self.reindex_output_height(&outpoint, row.height, None);
            self.delete(Column::Outputs, keys::outpoint(txid, outpoint.vout));

            if let Some(spender) = row.spent_by {
                let input_key = keys::outpoint(&spender.txid, spender.vin);
                if let Some(mut input) = self.get_row::<InputRow>(Column::Inputs, &input_key)? {
                    input.linked = false;
                    self.put_row(Column::Inputs, input_key, &input)?;
                    self.put(Column::Unlinked, keys::unlinked(&outpoint, &spender), Vec::new());
                }
                if !dependents.contains(&spender.txid) {
                    dependents.push(spender.txid);
                }
            }
        }

        for (key, value) in self.scan_prefix(Column::Inputs, txid.as_bytes())? {
            let input: InputRow = decode_row(Column::Inputs, &value)?;
            let spender = InputRef { txid: *txid, vin: keys::u32_at(Column::Inputs, &key, 32)? };
            self.delete(Column::Inputs, key);
            if let Some(h) = input.height {
                self.delete(Column::InputHeights, keys::height_outpoint(h, txid, spender.vin));
            }
            if !input.linked {
                self.delete(Column::Unlinked, keys::unlinked(&input.previous_output, &spender));
                continue;
            }
            let output_key = keys::outpoint(&input.previous_output.txid, input.previous_output.vout);
            if let Some(mut output) = self.get_row::<OutputRow>(Column::Outputs, &output_key)? {
                if output.spent_by == Some(spender) {
                    output.spent_by = None;
                    self.put_row(Column::Outputs, output_key, &output)?;
                }
            }
        }

        Ok(Some(dependents))
    }
}
