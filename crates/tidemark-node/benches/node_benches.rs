//! Criterion benchmarks for RocksDB-backed index operations.
//!
//! Covers: applying a block and reading address history.

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tempfile::TempDir;

use tidemark_core::constants::NetworkType;
use tidemark_core::index::Index;
use tidemark_core::traits::NullNotifier;
use tidemark_core::types::{OutPoint, TransactionExt};
use tidemark_sync::block_import::BlockImporter;
use tidemark_sync::testing::ChainBuilder;

use tidemark_node_lib::storage::RocksStore;

fn open_index(dir: &TempDir) -> Index {
    let store = RocksStore::open(dir.path()).unwrap();
    Index::new(Arc::new(store), Arc::new(NullNotifier))
}

/// Two blocks; the second carries a chain of 50 spends of the first
/// coinbase.
fn busy_chain() -> ChainBuilder {
    let mut chain = ChainBuilder::new();
    let b0 = chain.mine(vec![]);
    let mut txs = Vec::new();
    let mut prev = OutPoint::new(b0.txdata[0].id(), 0);
    for i in 0..50u8 {
        let tx = chain.spend(&[prev], 1_000_000 - u64::from(i), i % 8 + 1);
        prev = OutPoint::new(tx.id(), 0);
        txs.push(tx);
    }
    chain.mine(txs);
    chain
}

fn bench_apply_block(c: &mut Criterion) {
    let chain = busy_chain();
    let importer = BlockImporter::new(NetworkType::Regtest);
    c.bench_function("apply_block_50_txs", |b| {
        b.iter_with_setup(
            || {
                let dir = TempDir::new().unwrap();
                let index = open_index(&dir);
                let mut txn = index.begin();
                importer.apply(&mut txn, &chain.blocks()[0], 0, false).unwrap();
                txn.commit().unwrap();
                (dir, index)
            },
            |(_dir, index)| {
                let mut txn = index.begin();
                importer.apply(&mut txn, black_box(&chain.blocks()[1]), 1, true).unwrap();
                txn.commit().unwrap();
            },
        )
    });
}

fn bench_address_history(c: &mut Criterion) {
    let chain = busy_chain();
    let importer = BlockImporter::new(NetworkType::Regtest);
    let dir = TempDir::new().unwrap();
    let index = open_index(&dir);
    for (height, block) in chain.blocks().iter().enumerate() {
        let mut txn = index.begin();
        importer.apply(&mut txn, block, height as u64, false).unwrap();
        txn.commit().unwrap();
    }
    let address = chain.address_for(1);

    c.bench_function("address_history", |b| {
        b.iter(|| index.address_history(black_box(&address)).unwrap())
    });
}

criterion_group!(benches, bench_apply_block, bench_address_history);
criterion_main!(benches);
