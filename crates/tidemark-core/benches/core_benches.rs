//! Criterion benchmarks for tidemark-core hot paths.
//!
//! Covers: index-side transaction identity and script address derivation.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_2};
use bitcoin::script::Builder;
use bitcoin::transaction::Version;
use bitcoin::{Amount, PubkeyHash, PublicKey, ScriptBuf, Sequence, TxIn, TxOut, WPubkeyHash, Witness};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tidemark_core::address::script_addresses;
use tidemark_core::constants::NetworkType;
use tidemark_core::types::{Hash256, OutPoint, Transaction, TransactionExt};

fn p2pkh_script(tag: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([tag; 20]))
}

fn p2wpkh_script(tag: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([tag; 20]))
}

fn multisig_script() -> ScriptBuf {
    let g: PublicKey = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
        .parse()
        .expect("valid key");
    let g2: PublicKey = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5"
        .parse()
        .expect("valid key");
    Builder::new()
        .push_opcode(OP_PUSHNUM_1)
        .push_key(&g)
        .push_key(&g2)
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

fn sample_transaction(seed: u8, inputs: u8) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: (0..inputs)
            .map(|i| TxIn {
                previous_output: OutPoint::new(Hash256([seed.wrapping_add(i % 4); 32]), u32::from(i)).into(),
                script_sig: ScriptBuf::from_bytes(vec![0u8; 107]),
                sequence: Sequence::MAX,
                witness: Witness::from_slice(&[vec![0u8; 72], vec![0u8; 33]]),
            })
            .collect(),
        output: vec![
            TxOut { value: Amount::from_sat(50_000), script_pubkey: p2pkh_script(seed) },
            TxOut { value: Amount::from_sat(25_000), script_pubkey: p2wpkh_script(seed) },
        ],
    }
}

fn bench_txid(c: &mut Criterion) {
    let tx = sample_transaction(3, 2);
    c.bench_function("txid", |b| b.iter(|| black_box(&tx).id()));
}

fn bench_parent_txids(c: &mut Criterion) {
    let tx = sample_transaction(5, 64);
    c.bench_function("parent_txids_64_inputs", |b| b.iter(|| black_box(&tx).parent_txids()));
}

fn bench_script_addresses(c: &mut Criterion) {
    let legacy = p2pkh_script(9);
    let segwit = p2wpkh_script(9);
    let multisig = multisig_script();
    let mut group = c.benchmark_group("script_addresses");
    group.bench_function("p2pkh", |b| {
        b.iter(|| script_addresses(black_box(&legacy), NetworkType::Mainnet))
    });
    group.bench_function("p2wpkh", |b| {
        b.iter(|| script_addresses(black_box(&segwit), NetworkType::Mainnet))
    });
    group.bench_function("bare_multisig", |b| {
        b.iter(|| script_addresses(black_box(&multisig), NetworkType::Mainnet))
    });
    group.finish();
}

criterion_group!(benches, bench_txid, bench_parent_txids, bench_script_addresses);
criterion_main!(benches);
