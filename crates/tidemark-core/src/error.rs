//! Error types for the Tidemark indexer.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("consensus decode: {0}")] Consensus(String),
    #[error("invalid hex: {0}")] InvalidHex(String),
}

impl From<bitcoin::consensus::encode::Error> for DecodeError {
    fn from(e: bitcoin::consensus::encode::Error) -> Self {
        Self::Consensus(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("backend: {0}")] Backend(String),
    #[error("corrupt row in {column}: {reason}")] Corrupt { column: &'static str, reason: String },
    #[error("missing column family: {0}")] MissingColumn(&'static str),
    #[error("block at height {height} already stored with hash {existing}")] BlockConflict { height: u64, existing: String },
    #[error("transaction {0} not found")] MissingTransaction(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("node unavailable: {0}")] Unavailable(String),
    #[error("rpc error {code}: {message}")] Rpc { code: i64, message: String },
    #[error("not found: {0}")] NotFound(String),
    #[error("rejected: {0}")] Rejected(String),
    #[error("malformed response: {0}")] Malformed(String),
    #[error(transparent)] Decode(#[from] DecodeError),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Source(#[from] SourceError),
    #[error(transparent)] Decode(#[from] DecodeError),
    #[error("block at height {height} does not extend an empty chain")] Disconnected { height: u64 },
    #[error("engine is shutting down")] Closed,
}
