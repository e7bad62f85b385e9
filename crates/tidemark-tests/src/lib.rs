//! End-to-end scenarios for the Tidemark sync engine.
//!
//! The tests drive a full [`SyncEngine`](tidemark_sync::SyncEngine)
//! against an in-memory upstream chain and check the index, the tip, and
//! the emitted events after blocks, reorgs, and mempool churn.

pub mod helpers;
