//! Collaborator interfaces consumed by the sync engine.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::SourceError;
use crate::notify::Notification;
use crate::types::{Block, ChainTip, Hash256, Transaction};

/// Asynchronous signals raised by a [`ChainSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// The connection to the upstream node was (re)established.
    Connected,
    /// A transaction entered the upstream mempool.
    NewTx(Hash256),
    /// The upstream best block changed.
    NewBlock,
}

/// Access to the upstream blockchain node.
///
/// Implementations are expected to enforce their own request timeouts;
/// the engine retries any returned error with backoff.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Best block of the upstream chain.
    async fn latest_tip(&self) -> Result<ChainTip, SourceError>;

    /// Block at `height` on the upstream best chain.
    async fn block_at(&self, height: u64) -> Result<Block, SourceError>;

    /// Any transaction known to the upstream node, confirmed or not.
    async fn transaction(&self, txid: &Hash256) -> Result<Transaction, SourceError>;

    /// Txids currently in the upstream mempool.
    async fn mempool_txids(&self) -> Result<Vec<Hash256>, SourceError>;

    /// Submit a raw transaction for relay.
    async fn send_transaction(&self, raw: &[u8]) -> Result<(), SourceError>;

    /// Subscribe to upstream events.
    fn subscribe(&self) -> broadcast::Receiver<ChainEvent>;
}

/// Receives notifications once the storage transaction that produced them
/// has committed.
pub trait Notifier: Send + Sync {
    fn deliver(&self, notifications: &[Notification]);
}

/// Notifier that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn deliver(&self, _notifications: &[Notification]) {}
}
