//! Reconciling the local unconfirmed set with the upstream mempool.

use std::collections::{HashMap, HashSet, VecDeque};

use bitcoin::consensus::encode::deserialize;
use tracing::{debug, info, warn};

use tidemark_core::error::SyncError;
use tidemark_core::index::Index;
use tidemark_core::keyed_lock::KeyedLock;
use tidemark_core::traits::ChainSource;
use tidemark_core::types::{Hash256, Transaction, TransactionExt};

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Local unconfirmed transactions deleted, cascades included.
    pub removed: Vec<Hash256>,
    /// Stale transactions the upstream node accepted again.
    pub resubmitted: Vec<Hash256>,
    /// Upstream mempool txids not indexed yet; the caller imports them.
    pub missing: Vec<Hash256>,
}

/// Diffs local unconfirmed transactions against the upstream mempool.
#[derive(Debug, Clone)]
pub struct MempoolReconciler {
    batch_size: usize,
}

impl MempoolReconciler {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size: batch_size.max(1) }
    }

    /// Run one pass.
    ///
    /// With `resubmit`, stale local transactions are first sent upstream
    /// parents-first; the ones accepted are kept. The rest are removed in
    /// batches under the exclusive lock, each removal cascading to the
    /// transactions that spent its outputs.
    pub async fn reconcile(
        &self,
        index: &Index,
        source: &dyn ChainSource,
        locks: &KeyedLock<Hash256>,
        resubmit: bool,
    ) -> Result<Reconciliation, SyncError> {
        let local: HashSet<Hash256> = index.unconfirmed_txids()?.into_iter().collect();
        let upstream = source.mempool_txids().await?;
        let upstream_set: HashSet<Hash256> = upstream.iter().copied().collect();

        let mut stale: Vec<Hash256> = local.difference(&upstream_set).copied().collect();
        stale.sort();
        let missing: Vec<Hash256> = upstream.into_iter().filter(|txid| !local.contains(txid)).collect();

        let mut resubmitted = Vec::new();
        if resubmit && !stale.is_empty() {
            let raws = index.begin().raw_transactions(&stale)?;
            let mut decoded = Vec::with_capacity(raws.len());
            for (txid, raw) in raws {
                match deserialize::<Transaction>(&raw) {
                    Ok(tx) => decoded.push((txid, raw, tx)),
                    Err(e) => warn!(%txid, "stored transaction does not decode: {e}"),
                }
            }
            let order = toposort(decoded.iter().map(|(txid, _, tx)| (*txid, tx)));
            let raw_by_txid: HashMap<Hash256, &[u8]> =
                decoded.iter().map(|(txid, raw, _)| (*txid, raw.as_slice())).collect();
            for txid in order {
                let Some(raw) = raw_by_txid.get(&txid) else { continue };
                match source.send_transaction(raw).await {
                    Ok(()) => {
                        debug!(%txid, "resubmitted stale transaction");
                        resubmitted.push(txid);
                    }
                    Err(e) => debug!(%txid, "resubmission rejected: {e}"),
                }
            }
            stale.retain(|txid| !resubmitted.contains(txid));
        }

        let removed = if stale.is_empty() {
            Vec::new()
        } else {
            locks.with_exclusive(self.remove(index, &stale)).await?
        };

        if !removed.is_empty() || !resubmitted.is_empty() || !missing.is_empty() {
            info!(
                removed = removed.len(),
                resubmitted = resubmitted.len(),
                missing = missing.len(),
                "reconciled mempool"
            );
        }
        Ok(Reconciliation { removed, resubmitted, missing })
    }

    async fn remove(&self, index: &Index, stale: &[Hash256]) -> Result<Vec<Hash256>, SyncError> {
        let mut removed = Vec::new();
        let mut seen: HashSet<Hash256> = HashSet::new();
        for batch in stale.chunks(self.batch_size) {
            let mut txn = index.begin();
            let mut queue: VecDeque<Hash256> = batch.iter().copied().collect();
            seen.extend(batch.iter().copied());
            while let Some(txid) = queue.pop_front() {
                let Some(dependents) = txn.remove_unconfirmed(&txid)? else {
                    continue;
                };
                txn.outbox().remove_tx(txid, false);
                removed.push(txid);
                for dependent in dependents {
                    if seen.insert(dependent) {
                        queue.push_back(dependent);
                    }
                }
            }
            txn.commit()?;
        }
        Ok(removed)
    }
}

/// Order transactions so that each comes after every parent in the set.
///
/// Unrelated transactions keep their input order.
pub fn toposort<'a>(txs: impl IntoIterator<Item = (Hash256, &'a Transaction)>) -> Vec<Hash256> {
    let txs: Vec<(Hash256, &Transaction)> = txs.into_iter().collect();
    let members: HashSet<Hash256> = txs.iter().map(|(txid, _)| *txid).collect();

    let mut pending: HashMap<Hash256, usize> = HashMap::new();
    let mut children: HashMap<Hash256, Vec<Hash256>> = HashMap::new();
    for (txid, tx) in &txs {
        let parents: Vec<Hash256> = tx
            .parent_txids()
            .into_iter()
            .filter(|p| p != txid && members.contains(p))
            .collect();
        pending.insert(*txid, parents.len());
        for parent in parents {
            children.entry(parent).or_default().push(*txid);
        }
    }

    let mut ready: VecDeque<Hash256> = txs
        .iter()
        .map(|(txid, _)| *txid)
        .filter(|txid| pending.get(txid) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(txs.len());
    while let Some(txid) = ready.pop_front() {
        order.push(txid);
        for child in children.get(&txid).into_iter().flatten() {
            if let Some(count) = pending.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(*child);
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidemark_core::constants::NetworkType;
    use tidemark_core::notify::Notification;
    use tidemark_core::store::MemoryStore;
    use tidemark_core::types::OutPoint;

    use crate::block_import::BlockImporter;
    use crate::testing::{ChainBuilder, MockChain, RecordingNotifier, SendPolicy};
    use crate::tx_import::TxImporter;

    struct Fixture {
        index: Index,
        notifier: Arc<RecordingNotifier>,
        source: MockChain,
        parent: Transaction,
        child: Transaction,
        other: Transaction,
    }

    fn fixture() -> Fixture {
        let notifier = Arc::new(RecordingNotifier::default());
        let index = Index::new(Arc::new(MemoryStore::new()), notifier.clone());
        let mut chain = ChainBuilder::new();
        let b0 = chain.mine(vec![]);
        let b1 = chain.mine(vec![]);
        let importer = BlockImporter::new(NetworkType::Regtest);
        for (height, block) in [&b0, &b1].into_iter().enumerate() {
            let mut txn = index.begin();
            importer.apply(&mut txn, block, height as u64, false).unwrap();
            txn.commit().unwrap();
        }

        let parent = chain.spend(&[OutPoint::new(b0.txdata[0].id(), 0)], 100, 1);
        let child = chain.spend(&[OutPoint::new(parent.id(), 0)], 90, 2);
        let other = chain.spend(&[OutPoint::new(b1.txdata[0].id(), 0)], 80, 3);
        let txs = TxImporter::new(NetworkType::Regtest);
        for tx in [&parent, &child, &other] {
            let mut txn = index.begin();
            txs.apply(&mut txn, tx).unwrap();
            txn.commit().unwrap();
        }
        notifier.take();

        let source = MockChain::from_blocks(chain.blocks().to_vec());
        Fixture { index, notifier, source, parent, child, other }
    }

    #[test]
    fn toposort_puts_parents_first() {
        let f = fixture();
        let order = toposort([
            (f.child.id(), &f.child),
            (f.other.id(), &f.other),
            (f.parent.id(), &f.parent),
        ]);
        assert_eq!(order, vec![f.other.id(), f.parent.id(), f.child.id()]);
    }

    #[tokio::test]
    async fn removes_stale_with_cascade() {
        let f = fixture();
        // Upstream only knows `other`; removing the parent cascades to the child.
        f.source.add_mempool_tx(f.other.clone());
        let locks = KeyedLock::new();
        let result = MempoolReconciler::new(250)
            .reconcile(&f.index, &f.source, &locks, false)
            .await
            .unwrap();

        let mut removed = result.removed.clone();
        removed.sort();
        let mut expected = vec![f.parent.id(), f.child.id()];
        expected.sort();
        assert_eq!(removed, expected);
        assert!(result.missing.is_empty());
        assert_eq!(f.index.unconfirmed_txids().unwrap(), vec![f.other.id()]);
        assert!(f.notifier.take().contains(&Notification::RemoveTx { txid: f.child.id(), confirmed: false }));
    }

    #[tokio::test]
    async fn small_batches_still_cascade() {
        let f = fixture();
        let locks = KeyedLock::new();
        let result = MempoolReconciler::new(1)
            .reconcile(&f.index, &f.source, &locks, false)
            .await
            .unwrap();
        assert_eq!(result.removed.len(), 3);
        assert!(f.index.unconfirmed_txids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resubmitted_transactions_are_kept_in_order() {
        let f = fixture();
        f.source.set_send_policy(SendPolicy::AcceptAll);
        let locks = KeyedLock::new();
        let result = MempoolReconciler::new(250)
            .reconcile(&f.index, &f.source, &locks, true)
            .await
            .unwrap();

        assert!(result.removed.is_empty());
        assert_eq!(result.resubmitted.len(), 3);
        let sent = f.source.sent_txids();
        let parent_at = sent.iter().position(|t| *t == f.parent.id()).unwrap();
        let child_at = sent.iter().position(|t| *t == f.child.id()).unwrap();
        assert!(parent_at < child_at);
    }

    #[tokio::test]
    async fn rejected_resubmissions_are_removed() {
        let f = fixture();
        f.source.set_send_policy(SendPolicy::RejectAll);
        let locks = KeyedLock::new();
        let result = MempoolReconciler::new(250)
            .reconcile(&f.index, &f.source, &locks, true)
            .await
            .unwrap();
        assert!(result.resubmitted.is_empty());
        assert_eq!(result.removed.len(), 3);
    }

    #[tokio::test]
    async fn reports_upstream_only_transactions() {
        let f = fixture();
        let mut chain = ChainBuilder::with_salt(4);
        let b = chain.mine(vec![]);
        let unknown = chain.spend(&[OutPoint::new(b.txdata[0].id(), 0)], 5, 9);
        f.source.add_mempool_tx(f.parent.clone());
        f.source.add_mempool_tx(f.child.clone());
        f.source.add_mempool_tx(f.other.clone());
        f.source.add_mempool_tx(unknown.clone());

        let locks = KeyedLock::new();
        let result = MempoolReconciler::new(250)
            .reconcile(&f.index, &f.source, &locks, false)
            .await
            .unwrap();
        assert!(result.removed.is_empty());
        assert_eq!(result.missing, vec![unknown.id()]);
    }
}
