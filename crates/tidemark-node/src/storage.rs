//! RocksDB-backed index storage.
//!
//! Implements [`KvStore`] with one column family per [`Column`]. Batches
//! are applied with a single RocksDB [`rocksdb::WriteBatch`], so a crash
//! never leaves a storage transaction half-written.

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};
use tracing::debug;

use tidemark_core::error::StoreError;
use tidemark_core::store::{BatchOp, Column, KvPairs, KvStore, WriteBatch};

/// RocksDB-backed [`KvStore`].
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a database at `path`, creating missing column
    /// families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Column::ALL
            .iter()
            .map(|column| ColumnFamilyDescriptor::new(column.name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        debug!(path = %path.as_ref().display(), "opened index database");
        Ok(Self { db })
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// Trigger manual compaction across all column families.
    pub fn compact(&self) -> Result<(), StoreError> {
        for column in Column::ALL {
            let cf = self.cf_handle(column)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }

    fn cf_handle(&self, column: Column) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(column.name())
            .ok_or(StoreError::MissingColumn(column.name()))
    }

    fn scan(
        &self,
        column: Column,
        start: &[u8],
        mut keep: impl FnMut(&[u8]) -> bool,
    ) -> Result<KvPairs, StoreError> {
        let cf = self.cf_handle(column)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward));
        let mut pairs = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            if !keep(&key) {
                break;
            }
            pairs.push((key.into_vec(), value.into_vec()));
        }
        Ok(pairs)
    }
}

impl KvStore for RocksStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf_handle(column)?;
        self.db
            .get_cf(cf, key)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<KvPairs, StoreError> {
        self.scan(column, prefix, |key| key.starts_with(prefix))
    }

    fn scan_from(&self, column: Column, start: &[u8]) -> Result<KvPairs, StoreError> {
        self.scan(column, start, |_| true)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch {
            match op {
                BatchOp::Put { column, key, value } => {
                    rocks_batch.put_cf(self.cf_handle(column)?, key, value);
                }
                BatchOp::Delete { column, key } => {
                    rocks_batch.delete_cf(self.cf_handle(column)?, key);
                }
            }
        }
        self.db
            .write(rocks_batch)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}
