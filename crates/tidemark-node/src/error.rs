//! Node-level errors.

use thiserror::Error;

use tidemark_core::error::{SourceError, StoreError};

/// Failures while assembling or running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("rpc server error: {0}")]
    Rpc(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
