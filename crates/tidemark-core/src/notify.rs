//! Subscriber notifications staged alongside index writes.
//!
//! Every notification is recorded on the storage transaction that produced
//! it and handed to the [`Notifier`](crate::traits::Notifier) only after
//! that transaction commits. A rolled-back transaction publishes nothing.

use serde::Serialize;

use crate::types::Hash256;

/// Block a confirmed event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRef {
    pub hash: Hash256,
    pub height: u64,
}

/// A single event for the notification service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BroadcastBlock { hash: Hash256, height: u64 },
    AddBlock { hash: Hash256 },
    RemoveBlock { hash: Hash256 },
    /// `block` is `None` for unconfirmed (or newly unconfirmed) transactions.
    BroadcastTx { txid: Hash256, block: Option<BlockRef> },
    AddTx { txid: Hash256, confirmed: bool },
    RemoveTx { txid: Hash256, confirmed: bool },
    BroadcastAddress { address: String, txid: Hash256, block: Option<BlockRef> },
}

/// Notifications pending on an open storage transaction.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<Notification>,
}

impl Outbox {
    pub fn broadcast_block(&mut self, hash: Hash256, height: u64) {
        self.pending.push(Notification::BroadcastBlock { hash, height });
    }

    pub fn add_block(&mut self, hash: Hash256) {
        self.pending.push(Notification::AddBlock { hash });
    }

    pub fn remove_block(&mut self, hash: Hash256) {
        self.pending.push(Notification::RemoveBlock { hash });
    }

    pub fn broadcast_tx(&mut self, txid: Hash256, block: Option<BlockRef>) {
        self.pending.push(Notification::BroadcastTx { txid, block });
    }

    pub fn add_tx(&mut self, txid: Hash256, confirmed: bool) {
        self.pending.push(Notification::AddTx { txid, confirmed });
    }

    pub fn remove_tx(&mut self, txid: Hash256, confirmed: bool) {
        self.pending.push(Notification::RemoveTx { txid, confirmed });
    }

    pub fn broadcast_address(&mut self, address: String, txid: Hash256, block: Option<BlockRef>) {
        self.pending.push(Notification::BroadcastAddress { address, txid, block });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn into_inner(self) -> Vec<Notification> {
        self.pending
    }
}
