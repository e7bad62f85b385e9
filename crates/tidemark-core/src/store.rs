//! Ordered key-value storage abstraction.
//!
//! The index is laid out over a fixed set of column families. Backends only
//! need point reads, ordered scans, and atomic batch writes; everything
//! transactional is layered on top in [`crate::index`].

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::error::StoreError;

/// Column families of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    /// Singleton metadata (the chain tip).
    Meta,
    /// height → block row.
    Blocks,
    /// block hash → height.
    BlockHashes,
    /// txid → transaction row.
    Txs,
    /// height ‖ txid → ().
    TxHeights,
    /// txid → () for every unconfirmed transaction.
    Mempool,
    /// txid ‖ vout → output row.
    Outputs,
    /// height ‖ txid ‖ vout → ().
    OutputHeights,
    /// txid ‖ vin → input row.
    Inputs,
    /// height ‖ txid ‖ vin → ().
    InputHeights,
    /// previous txid ‖ previous vout ‖ spender txid ‖ vin → ().
    Unlinked,
    /// address ‖ txid ‖ vout → ().
    AddressOutputs,
}

impl Column {
    pub const ALL: [Column; 12] = [
        Column::Meta,
        Column::Blocks,
        Column::BlockHashes,
        Column::Txs,
        Column::TxHeights,
        Column::Mempool,
        Column::Outputs,
        Column::OutputHeights,
        Column::Inputs,
        Column::InputHeights,
        Column::Unlinked,
        Column::AddressOutputs,
    ];

    /// Stable on-disk name of the column family.
    pub fn name(&self) -> &'static str {
        match self {
            Column::Meta => "meta",
            Column::Blocks => "blocks",
            Column::BlockHashes => "block_hashes",
            Column::Txs => "txs",
            Column::TxHeights => "tx_heights",
            Column::Mempool => "mempool",
            Column::Outputs => "outputs",
            Column::OutputHeights => "output_heights",
            Column::Inputs => "inputs",
            Column::InputHeights => "input_heights",
            Column::Unlinked => "unlinked",
            Column::AddressOutputs => "address_outputs",
        }
    }
}

/// A single staged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { column: Column, key: Vec<u8>, value: Vec<u8> },
    Delete { column: Column, key: Vec<u8> },
}

/// An ordered set of mutations applied atomically by [`KvStore::write`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, column: Column, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { column, key, value });
    }

    pub fn delete(&mut self, column: Column, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { column, key });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

impl IntoIterator for WriteBatch {
    type Item = BatchOp;
    type IntoIter = std::vec::IntoIter<BatchOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Key-value pairs returned by a scan, in ascending key order.
pub type KvPairs = Vec<(Vec<u8>, Vec<u8>)>;

/// Storage backend for the index.
///
/// Implementations must apply [`WriteBatch`]es atomically: after a crash
/// either every mutation of a batch is visible or none is.
pub trait KvStore: Send + Sync {
    /// Point lookup.
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<KvPairs, StoreError>;

    /// All entries with key `>= start`, in key order.
    fn scan_from(&self, column: Column, start: &[u8]) -> Result<KvPairs, StoreError>;

    /// Atomically apply a batch of mutations.
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// In-memory [`KvStore`] for tests and ephemeral indexes.
#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a column.
    pub fn len(&self, column: Column) -> usize {
        self.columns.read().get(&column).map_or(0, BTreeMap::len)
    }

    /// Full copy of every column, for comparing index states in tests.
    pub fn snapshot(&self) -> BTreeMap<Column, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.columns
            .read()
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(column, entries)| (*column, entries.clone()))
            .collect()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.columns.read().get(&column).and_then(|c| c.get(key).cloned()))
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<KvPairs, StoreError> {
        let columns = self.columns.read();
        let Some(entries) = columns.get(&column) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_from(&self, column: Column, start: &[u8]) -> Result<KvPairs, StoreError> {
        let columns = self.columns.read();
        let Some(entries) = columns.get(&column) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(start.to_vec()..)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.columns.write();
        for op in batch {
            match op {
                BatchOp::Put { column, key, value } => {
                    columns.entry(column).or_default().insert(key, value);
                }
                BatchOp::Delete { column, key } => {
                    if let Some(entries) = columns.get_mut(&column) {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
