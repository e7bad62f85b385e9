//! Tidemark sync: keeps a block/transaction/address index in step with an
//! upstream chain source.
//!
//! Blocks are applied through [`block_import::BlockImporter`], forks are
//! unwound by [`reorg::ReorgHandler`], unconfirmed transactions arrive
//! through [`tx_import::TxImporter`], and [`mempool_sync::MempoolReconciler`]
//! prunes what the upstream mempool dropped. [`engine::SyncEngine`] drives
//! all of them.

pub mod block_import;
pub mod config;
pub mod engine;
pub mod mempool_sync;
pub mod reorg;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tx_import;

pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncEvent, SyncState};
