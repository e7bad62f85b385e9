//! RocksDB storage tests against real on-disk databases.

use std::sync::Arc;

use tidemark_core::constants::NetworkType;
use tidemark_core::index::Index;
use tidemark_core::store::{Column, KvStore, MemoryStore, WriteBatch};
use tidemark_core::traits::NullNotifier;
use tidemark_core::types::{BlockExt, OutPoint, TransactionExt};
use tidemark_node_lib::storage::RocksStore;
use tidemark_sync::block_import::BlockImporter;
use tidemark_sync::reorg::ReorgHandler;
use tidemark_sync::testing::ChainBuilder;

fn open(dir: &tempfile::TempDir) -> RocksStore {
    RocksStore::open(dir.path().join("index")).unwrap()
}

#[test]
fn batch_writes_are_visible() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);

    let mut batch = WriteBatch::default();
    batch.put(Column::Txs, b"a".to_vec(), b"1".to_vec());
    batch.put(Column::Txs, b"b".to_vec(), b"2".to_vec());
    batch.put(Column::Mempool, b"a".to_vec(), vec![]);
    store.write(batch).unwrap();

    assert_eq!(store.get(Column::Txs, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(Column::Mempool, b"a").unwrap(), Some(vec![]));
    // Columns are independent.
    assert_eq!(store.get(Column::Mempool, b"b").unwrap(), None);

    let mut batch = WriteBatch::default();
    batch.delete(Column::Txs, b"a".to_vec());
    store.write(batch).unwrap();
    assert_eq!(store.get(Column::Txs, b"a").unwrap(), None);
    assert_eq!(store.get(Column::Txs, b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn scan_prefix_stays_inside_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);

    let mut batch = WriteBatch::default();
    for key in [&b"aa1"[..], b"ab1", b"ab2", b"ab\xff", b"ac0", b"b"] {
        batch.put(Column::AddressOutputs, key.to_vec(), vec![]);
    }
    store.write(batch).unwrap();

    let keys: Vec<Vec<u8>> = store
        .scan_prefix(Column::AddressOutputs, b"ab")
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![b"ab1".to_vec(), b"ab2".to_vec(), b"ab\xff".to_vec()]);

    let from: Vec<Vec<u8>> = store
        .scan_from(Column::AddressOutputs, b"ac")
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(from, vec![b"ac0".to_vec(), b"b".to_vec()]);
}

#[test]
fn data_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = ChainBuilder::new();
    chain.mine(vec![]);
    chain.mine(vec![]);
    {
        let index = Index::new(Arc::new(open(&dir)), Arc::new(NullNotifier));
        let importer = BlockImporter::new(NetworkType::Regtest);
        for (height, block) in chain.blocks().iter().enumerate() {
            let mut txn = index.begin();
            importer.apply(&mut txn, block, height as u64, false).unwrap();
            txn.commit().unwrap();
        }
    }

    let index = Index::new(Arc::new(open(&dir)), Arc::new(NullNotifier));
    assert_eq!(index.tip().unwrap(), chain.tip());
    assert_eq!(index.block_height(&chain.blocks()[1].id()).unwrap(), Some(1));
}

#[test]
fn matches_memory_store_through_import_and_rollback() {
    let mut chain = ChainBuilder::new();
    let b0 = chain.mine(vec![]);
    let a = chain.spend(&[OutPoint::new(b0.txdata[0].id(), 0)], 10_000, 1);
    let b = chain.spend(&[OutPoint::new(a.id(), 0)], 9_000, 2);
    chain.mine(vec![a, b]);
    chain.mine(vec![]);

    let dir = tempfile::tempdir().unwrap();
    let rocks = Arc::new(open(&dir));
    let memory = Arc::new(MemoryStore::new());
    let importer = BlockImporter::new(NetworkType::Regtest);

    for index in [
        Index::new(rocks.clone(), Arc::new(NullNotifier)),
        Index::new(memory.clone(), Arc::new(NullNotifier)),
    ] {
        for (height, block) in chain.blocks().iter().enumerate() {
            let mut txn = index.begin();
            importer.apply(&mut txn, block, height as u64, true).unwrap();
            txn.commit().unwrap();
        }
        let mut txn = index.begin();
        ReorgHandler.rollback(&mut txn, Some(0)).unwrap();
        txn.commit().unwrap();
    }

    let snapshot = memory.snapshot();
    for column in Column::ALL {
        let on_disk = rocks.scan_from(column, &[]).unwrap();
        let in_memory: Vec<(Vec<u8>, Vec<u8>)> = snapshot
            .get(&column)
            .map(|entries| entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        assert_eq!(on_disk, in_memory, "column {} differs", column.name());
    }
}
