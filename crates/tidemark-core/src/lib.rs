//! # tidemark-core
//! Chain data model, index schema, and concurrency primitives for the
//! Tidemark blockchain indexer.

pub mod address;
pub mod constants;
pub mod error;
pub mod index;
pub mod keyed_lock;
pub mod notify;
pub mod orphan_pool;
pub mod store;
pub mod traits;
pub mod types;
