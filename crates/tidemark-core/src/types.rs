//! Index-side identifiers and the chain tip.
//!
//! Blocks and transactions are the `bitcoin` crate's types; the index keys
//! them by [`Hash256`] and [`OutPoint`], which convert to and from the
//! crate's `Txid`, `BlockHash` and `OutPoint`.

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub use bitcoin::{Block, Transaction};

use crate::constants::COINBASE_VOUT;
use crate::error::DecodeError;

/// A 32-byte hash value.
///
/// Used for transaction IDs and block hashes as index keys. Stored
/// in internal byte order; [`Display`](fmt::Display) and [`FromStr`] use
/// the byte-reversed hex form that bitcoind prints, and so does serde.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used for coinbase previous outpoints and as the
    /// parent of the first block.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Build from a slice that must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

impl FromStr for Hash256 {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(DecodeError::InvalidHex(format!("expected 64 characters, got {}", s.len())));
        }
        let mut bytes = hex::decode(s).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
        bytes.reverse();
        Self::from_slice(&bytes).ok_or_else(|| DecodeError::InvalidHex("expected 32 bytes".into()))
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Hash256 {
    pub fn to_txid(self) -> Txid {
        Txid::from_byte_array(self.0)
    }

    pub fn to_block_hash(self) -> BlockHash {
        BlockHash::from_byte_array(self.0)
    }
}

impl From<Txid> for Hash256 {
    fn from(txid: Txid) -> Self {
        Self(txid.to_byte_array())
    }
}

impl From<BlockHash> for Hash256 {
    fn from(hash: BlockHash) -> Self {
        Self(hash.to_byte_array())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            vout: COINBASE_VOUT,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == COINBASE_VOUT
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl From<bitcoin::OutPoint> for OutPoint {
    fn from(outpoint: bitcoin::OutPoint) -> Self {
        Self::new(outpoint.txid.into(), outpoint.vout)
    }
}

impl From<OutPoint> for bitcoin::OutPoint {
    fn from(outpoint: OutPoint) -> Self {
        Self { txid: outpoint.txid.to_txid(), vout: outpoint.vout }
    }
}

/// Index-side identity of a transaction.
pub trait TransactionExt {
    /// Txid as an index key.
    fn id(&self) -> Hash256;

    /// Unique previous txids referenced by the inputs, in first-seen order.
    /// The coinbase null txid is excluded.
    fn parent_txids(&self) -> Vec<Hash256>;
}

impl TransactionExt for Transaction {
    fn id(&self) -> Hash256 {
        self.compute_txid().into()
    }

    fn parent_txids(&self) -> Vec<Hash256> {
        let mut seen = Vec::with_capacity(self.input.len());
        for input in &self.input {
            let prev = input.previous_output;
            if prev.is_null() {
                continue;
            }
            let txid = Hash256::from(prev.txid);
            if !seen.contains(&txid) {
                seen.push(txid);
            }
        }
        seen
    }
}

/// Index-side identity of a block.
pub trait BlockExt {
    fn id(&self) -> Hash256;
    fn prev_id(&self) -> Hash256;
    /// Transaction IDs in block order.
    fn txids(&self) -> Vec<Hash256>;
}

impl BlockExt for Block {
    fn id(&self) -> Hash256 {
        self.block_hash().into()
    }

    fn prev_id(&self) -> Hash256 {
        self.header.prev_blockhash.into()
    }

    fn txids(&self) -> Vec<Hash256> {
        self.txdata.iter().map(TransactionExt::id).collect()
    }
}

/// The hash and height of a chain's highest block.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct ChainTip {
    pub height: u64,
    pub hash: Hash256,
}

impl ChainTip {
    pub fn new(height: u64, hash: Hash256) -> Self {
        Self { height, hash }
    }
}

impl fmt::Display for ChainTip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.height)
    }
}
