//! The sync engine: chain catch-up, reorg handling, and unconfirmed
//! transaction intake.
//!
//! [`SyncEngine`] owns the in-memory view of both chain tips and drives
//! the [`BlockImporter`], [`ReorgHandler`], [`TxImporter`], and
//! [`MempoolReconciler`] against a shared [`Index`]. The catch-up loop
//! runs in a single slot: a caller arriving while it is active waits for
//! and returns the in-flight result instead of starting a second loop.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tidemark_core::error::SyncError;
use tidemark_core::index::Index;
use tidemark_core::keyed_lock::KeyedLock;
use tidemark_core::orphan_pool::OrphanPool;
use tidemark_core::traits::{ChainEvent, ChainSource};
use tidemark_core::types::{Block, BlockExt, ChainTip, Hash256, TransactionExt};

use crate::block_import::BlockImporter;
use crate::config::SyncConfig;
use crate::mempool_sync::{MempoolReconciler, Reconciliation};
use crate::reorg::ReorgHandler;
use crate::tx_import::{TxImport, TxImporter};

/// Where the catch-up loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    CatchingUp,
    RollingBack,
}

/// Events published to engine subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// The local tip advanced to a newly indexed block.
    Latest(ChainTip),
    /// A transaction was newly indexed, confirmed or not.
    Tx(Hash256),
}

/// Outcome of one catch-up iteration.
enum Step {
    Synced,
    Advanced,
    RolledBack,
}

type SlotResult = Option<Option<ChainTip>>;

enum Slot {
    Leader(watch::Sender<SlotResult>),
    Follower(watch::Receiver<SlotResult>),
}

/// Keeps an index in step with an upstream chain.
pub struct SyncEngine {
    index: Index,
    source: Arc<dyn ChainSource>,
    config: SyncConfig,
    locks: KeyedLock<Hash256>,
    orphans: Mutex<OrphanPool>,
    blocks: BlockImporter,
    txs: TxImporter,
    reorg: ReorgHandler,
    mempool: MempoolReconciler,
    local_tip: RwLock<Option<ChainTip>>,
    external_tip: RwLock<Option<ChainTip>>,
    broadcast: AtomicBool,
    state: RwLock<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    import_slots: Semaphore,
    in_flight: Mutex<Option<watch::Receiver<SlotResult>>>,
    /// A caller queued behind the running sync pass.
    rerun: AtomicBool,
    rerun_resubmit: AtomicBool,
}

impl SyncEngine {
    pub fn new(index: Index, source: Arc<dyn ChainSource>, config: SyncConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new(Self {
            blocks: BlockImporter::new(config.network),
            txs: TxImporter::new(config.network),
            reorg: ReorgHandler,
            mempool: MempoolReconciler::new(config.removal_batch_size),
            import_slots: Semaphore::new(config.tx_import_concurrency.max(1)),
            index,
            source,
            config,
            locks: KeyedLock::new(),
            orphans: Mutex::new(OrphanPool::new()),
            local_tip: RwLock::new(None),
            external_tip: RwLock::new(None),
            broadcast: AtomicBool::new(false),
            state: RwLock::new(SyncState::Idle),
            events,
            in_flight: Mutex::new(None),
            rerun: AtomicBool::new(false),
            rerun_resubmit: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    pub fn local_tip(&self) -> Option<ChainTip> {
        *self.local_tip.read()
    }

    pub fn external_tip(&self) -> Option<ChainTip> {
        *self.external_tip.read()
    }

    /// Whether the last applied block fanned out per-event notifications.
    pub fn broadcast_enabled(&self) -> bool {
        self.broadcast.load(Ordering::Relaxed)
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Number of transactions waiting on missing parents.
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // Catch-up loop
    // ------------------------------------------------------------------

    /// Bring the index level with the upstream tip, then reconcile the
    /// mempool (resubmitting stale transactions when `resubmit` is set).
    ///
    /// Never fails: errors are logged and retried with backoff. Returns
    /// the local tip at parity. A call made while another is running is
    /// queued behind it: the running pass goes round again before it
    /// finishes, and both calls return that second result.
    pub async fn sync(self: &Arc<Self>, resubmit: bool) -> Option<ChainTip> {
        loop {
            match self.claim_slot(resubmit) {
                Slot::Follower(mut rx) => match rx.wait_for(Option::is_some).await {
                    Ok(result) => return (*result).flatten(),
                    // The leader was dropped mid-run; take over.
                    Err(_) => continue,
                },
                Slot::Leader(tx) => {
                    let mut guard = SlotGuard { engine: self, armed: true };
                    let mut resubmit = resubmit;
                    let tip = loop {
                        let tip = self.catch_up(resubmit).await;
                        match self.release_slot(&mut guard) {
                            Some(queued_resubmit) => resubmit = queued_resubmit,
                            None => break tip,
                        }
                    };
                    let _ = tx.send(Some(tip));
                    return tip;
                }
            }
        }
    }

    fn claim_slot(&self, resubmit: bool) -> Slot {
        let mut slot = self.in_flight.lock();
        match slot.as_ref() {
            Some(rx) => {
                // Set under the slot lock so release_slot cannot miss it.
                if resubmit {
                    self.rerun_resubmit.store(true, Ordering::SeqCst);
                }
                self.rerun.store(true, Ordering::SeqCst);
                Slot::Follower(rx.clone())
            }
            None => {
                let (tx, rx) = watch::channel(None);
                *slot = Some(rx);
                Slot::Leader(tx)
            }
        }
    }

    /// Free the slot, unless a caller queued behind the finished pass.
    /// Returns that caller's resubmit flag when another pass is due.
    fn release_slot(&self, guard: &mut SlotGuard<'_>) -> Option<bool> {
        let mut slot = self.in_flight.lock();
        if self.rerun.swap(false, Ordering::SeqCst) {
            return Some(self.rerun_resubmit.swap(false, Ordering::SeqCst));
        }
        *slot = None;
        guard.armed = false;
        None
    }

    async fn catch_up(self: &Arc<Self>, mut resubmit: bool) -> Option<ChainTip> {
        if self.local_tip().is_none() {
            self.refresh_local_tip().await;
        }
        loop {
            match self.step().await {
                Ok(Step::Synced) => {
                    // A caller joined after the upstream tip was read.
                    if self.rerun.swap(false, Ordering::SeqCst) {
                        resubmit |= self.rerun_resubmit.swap(false, Ordering::SeqCst);
                        continue;
                    }
                    break;
                }
                Ok(Step::Advanced | Step::RolledBack) => {}
                Err(e) => {
                    let height = self.local_tip().map(|t| t.height);
                    error!(?height, "sync iteration failed: {e}");
                    self.refresh_local_tip().await;
                    tokio::time::sleep(self.config.retry_backoff()).await;
                }
            }
        }
        self.set_state(SyncState::Idle);
        let tip = self.local_tip();
        self.reconcile_mempool(resubmit).await;
        tip
    }

    async fn step(&self) -> Result<Step, SyncError> {
        let external = self.source.latest_tip().await?;
        *self.external_tip.write() = Some(external);

        let local = self.local_tip();
        if local == Some(external) {
            return Ok(Step::Synced);
        }
        self.set_state(SyncState::CatchingUp);

        let next = match local {
            Some(tip) => (tip.height + 1).min(external.height),
            None => 0,
        };
        let block = self.source.block_at(next).await?;
        let extends = match local {
            Some(tip) => next == tip.height + 1 && block.prev_id() == tip.hash,
            None => block.prev_id().is_zero(),
        };

        match local {
            _ if extends => {
                self.apply_block(block, next, external).await?;
                Ok(Step::Advanced)
            }
            Some(tip) => {
                self.roll_back(tip, external).await?;
                Ok(Step::RolledBack)
            }
            None => Err(SyncError::Disconnected { height: next }),
        }
    }

    async fn apply_block(&self, block: Block, height: u64, external: ChainTip) -> Result<(), SyncError> {
        let local_height = self.local_tip().map_or(0, |t| t.height);
        let broadcast = self.config.broadcast_enabled(local_height, external.height);
        self.broadcast.store(broadcast, Ordering::Relaxed);

        let started = Instant::now();
        let applied = self
            .locks
            .with_keys(BlockImporter::lock_keys(&block), async {
                let mut txn = self.index.begin();
                let applied = self.blocks.apply(&mut txn, &block, height, broadcast)?;
                txn.commit()?;
                Ok::<_, SyncError>(applied)
            })
            .await?;

        let tip = self.index.tip()?;
        *self.local_tip.write() = tip;
        info!(
            height,
            hash = %applied.hash,
            txs = applied.txids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "indexed block"
        );

        if applied.inserted {
            if let Some(tip) = tip {
                self.emit(SyncEvent::Latest(tip));
            }
            for txid in &applied.txids {
                self.emit(SyncEvent::Tx(*txid));
            }
            {
                let mut orphans = self.orphans.lock();
                for txid in &applied.txids {
                    orphans.remove(txid);
                }
            }
            self.drain_orphans(applied.txids).await;
        }
        Ok(())
    }

    async fn roll_back(&self, local: ChainTip, external: ChainTip) -> Result<(), SyncError> {
        self.set_state(SyncState::RollingBack);
        let start = local.height.min(external.height);
        let fork = self.reorg.find_fork(&self.index, self.source.as_ref(), start).await?;

        let rollback = self
            .locks
            .with_exclusive(async {
                let mut txn = self.index.begin();
                let rollback = self.reorg.rollback(&mut txn, fork)?;
                txn.commit()?;
                Ok::<_, SyncError>(rollback)
            })
            .await?;

        *self.local_tip.write() = self.index.tip()?;
        warn!(
            ?fork,
            from = local.height,
            removed = rollback.removed_blocks.len(),
            unconfirmed = rollback.unconfirmed_txids.len(),
            "rolled back divergent blocks"
        );
        Ok(())
    }

    /// Re-read the local tip from storage, retrying until it succeeds.
    pub async fn refresh_local_tip(&self) -> Option<ChainTip> {
        loop {
            match self.index.tip() {
                Ok(tip) => {
                    *self.local_tip.write() = tip;
                    return tip;
                }
                Err(e) => {
                    error!("failed to read local tip: {e}");
                    tokio::time::sleep(self.config.tip_refresh_backoff()).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Unconfirmed transactions
    // ------------------------------------------------------------------

    /// Import one unconfirmed transaction by txid.
    ///
    /// At most `tx_import_concurrency` imports run at once; the rest wait.
    /// A transaction with missing parents is parked in the orphan pool and
    /// imported automatically once they arrive.
    pub async fn import_tx(&self, txid: Hash256) -> Result<TxImport, SyncError> {
        let _permit = self.import_slots.acquire().await.map_err(|_| SyncError::Closed)?;
        let outcome = self.import_one(txid).await?;
        if outcome == TxImport::Imported {
            self.drain_orphans([txid]).await;
        }
        Ok(outcome)
    }

    async fn import_one(&self, txid: Hash256) -> Result<TxImport, SyncError> {
        if self.index.transaction(&txid)?.is_some() {
            return Ok(TxImport::AlreadyKnown);
        }
        let tx = self.source.transaction(&txid).await?;

        let mut keys = tx.parent_txids();
        keys.push(txid);
        let outcome = self
            .locks
            .with_keys(keys, async {
                let mut txn = self.index.begin();
                let outcome = self.txs.apply(&mut txn, &tx)?;
                match &outcome {
                    TxImport::Imported => txn.commit()?,
                    TxImport::Deferred(missing) => {
                        self.orphans.lock().record_orphan(txid, missing.iter().copied());
                    }
                    TxImport::AlreadyKnown => {}
                }
                Ok::<_, SyncError>(outcome)
            })
            .await?;

        match &outcome {
            TxImport::Imported => {
                debug!(%txid, "imported unconfirmed transaction");
                self.emit(SyncEvent::Tx(txid));
            }
            TxImport::Deferred(missing) => {
                debug!(%txid, missing = missing.len(), "deferred transaction with unknown parents");
            }
            TxImport::AlreadyKnown => {}
        }
        Ok(outcome)
    }

    /// Import every orphan unblocked by `parents`, and whatever those
    /// unblock in turn.
    async fn drain_orphans(&self, parents: impl IntoIterator<Item = Hash256>) {
        let mut ready: VecDeque<Hash256> = VecDeque::new();
        {
            let mut orphans = self.orphans.lock();
            for parent in parents {
                ready.extend(orphans.resolve(&parent));
            }
        }
        while let Some(txid) = ready.pop_front() {
            match self.import_one(txid).await {
                Ok(TxImport::Imported) => {
                    let unblocked = self.orphans.lock().resolve(&txid);
                    ready.extend(unblocked);
                }
                Ok(_) => {}
                Err(e) => warn!(%txid, "failed to import unblocked transaction: {e}"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Mempool
    // ------------------------------------------------------------------

    /// Reconcile the local unconfirmed set with the upstream mempool and
    /// import what is missing. Orphans no longer in the upstream mempool
    /// are dropped. Retries until a pass succeeds.
    pub async fn reconcile_mempool(self: &Arc<Self>, resubmit: bool) -> Reconciliation {
        loop {
            let pass = self
                .mempool
                .reconcile(&self.index, self.source.as_ref(), &self.locks, resubmit)
                .await;
            match pass {
                Ok(report) => {
                    // Orphans are never indexed, so one still upstream is in `missing`.
                    let upstream: HashSet<Hash256> = report.missing.iter().copied().collect();
                    let evicted = self.orphans.lock().retain(|txid| upstream.contains(txid));
                    if !evicted.is_empty() {
                        debug!(evicted = evicted.len(), "dropped orphans gone from the upstream mempool");
                    }

                    let mut imports = JoinSet::new();
                    for txid in report.missing.iter().copied() {
                        let engine = Arc::clone(self);
                        imports.spawn(async move { (txid, engine.import_tx(txid).await) });
                    }
                    while let Some(joined) = imports.join_next().await {
                        match joined {
                            Ok((txid, Err(e))) => warn!(%txid, "mempool import failed: {e}"),
                            Ok(_) => {}
                            Err(e) => warn!("mempool import task failed: {e}"),
                        }
                    }
                    return report;
                }
                Err(e) => {
                    error!("mempool reconciliation failed: {e}");
                    tokio::time::sleep(self.config.mempool_retry_backoff()).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Catch up, then follow upstream events until the source closes its
    /// event channel.
    pub async fn run(self: &Arc<Self>) {
        let mut events = self.source.subscribe();

        let local = self.refresh_local_tip().await;
        match self.source.latest_tip().await {
            Ok(external) => {
                let indexed = local.map_or(0, |t| t.height + 1);
                let upstream = external.height + 1;
                info!(indexed, upstream, "got {indexed} blocks in db out of {upstream}");
            }
            Err(e) => warn!("could not read upstream tip: {e}"),
        }

        let resubmit = self.config.resubmit;
        self.sync(resubmit).await;

        loop {
            match events.recv().await {
                Ok(ChainEvent::Connected) => {
                    info!("upstream connected; resyncing");
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        engine.sync(resubmit).await;
                    });
                }
                Ok(ChainEvent::NewBlock) => {
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        engine.sync(false).await;
                    });
                }
                Ok(ChainEvent::NewTx(txid)) => {
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = engine.import_tx(txid).await {
                            warn!(%txid, "failed to import transaction: {e}");
                        }
                    });
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "lagged behind on chain events; resyncing");
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        engine.sync(false).await;
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("chain event channel closed, stopping sync engine");
                    break;
                }
            }
        }
    }
}

/// Frees the sync slot if the leader is dropped before releasing it.
struct SlotGuard<'a> {
    engine: &'a SyncEngine,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.engine.in_flight.lock() = None;
        }
    }
}
