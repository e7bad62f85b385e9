//! Node composition and event loop.
//!
//! The [`Node`] struct wires RocksDB storage, the notification fan-out,
//! the upstream chain source, and the [`SyncEngine`] into a running
//! indexer.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tidemark_core::error::StoreError;
use tidemark_core::index::Index;
use tidemark_core::notify::Notification;
use tidemark_core::traits::ChainSource;
use tidemark_core::types::ChainTip;
use tidemark_sync::{SyncEngine, SyncEvent, SyncState};

use crate::bitcoind::BitcoindClient;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::notify::BroadcastNotifier;
use crate::storage::RocksStore;

/// Point-in-time view of the node's sync progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub state: SyncState,
    pub local_tip: Option<ChainTip>,
    pub external_tip: Option<ChainTip>,
    pub broadcast_enabled: bool,
    pub orphans: usize,
    pub unconfirmed: usize,
}

/// The indexer node.
pub struct Node {
    config: NodeConfig,
    store: Arc<RocksStore>,
    notifier: Arc<BroadcastNotifier>,
    engine: Arc<SyncEngine>,
    /// Set when the source is a live bitcoind that needs polling.
    bitcoind: Option<Arc<BitcoindClient>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Open storage and connect to the configured bitcoind.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        let client = Arc::new(BitcoindClient::new(
            config.bitcoind_url(),
            config.bitcoind.user.clone(),
            config.bitcoind.password.clone(),
            config.bitcoind.timeout(),
        )?);
        let source: Arc<dyn ChainSource> = client.clone();
        Self::assemble(config, source, Some(client))
    }

    /// Open storage against an arbitrary chain source (no polling).
    pub fn with_source(config: NodeConfig, source: Arc<dyn ChainSource>) -> Result<Arc<Self>, NodeError> {
        Self::assemble(config, source, None)
    }

    fn assemble(
        config: NodeConfig,
        source: Arc<dyn ChainSource>,
        bitcoind: Option<Arc<BitcoindClient>>,
    ) -> Result<Arc<Self>, NodeError> {
        let store = Arc::new(RocksStore::open(config.db_path())?);
        let notifier = Arc::new(BroadcastNotifier::new(config.sync.event_capacity));
        let index = Index::new(store.clone(), notifier.clone());

        let mut sync = config.sync.clone();
        sync.network = config.network_type;
        let engine = SyncEngine::new(index, source, sync);

        Ok(Arc::new(Self {
            config,
            store,
            notifier,
            engine,
            bitcoind,
            poller: Mutex::new(None),
        }))
    }

    /// Run until the upstream event stream closes.
    ///
    /// Starts the bitcoind poller (if any) and hands control to the sync
    /// engine's event loop.
    pub async fn run(self: &Arc<Self>) {
        if let Some(client) = &self.bitcoind {
            let handle = client.spawn_poller(self.config.bitcoind.poll_interval());
            if let Some(previous) = self.poller.lock().replace(handle) {
                previous.abort();
            }
        }

        self.engine.run().await;

        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.store.flush() {
            warn!("failed to flush index: {e}");
        }
        info!("node event loop finished");
    }

    pub fn index(&self) -> &Index {
        self.engine.index()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Committed index notifications.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Engine progress events.
    pub fn sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    pub fn status(&self) -> Result<NodeStatus, StoreError> {
        Ok(NodeStatus {
            state: self.engine.state(),
            local_tip: self.engine.local_tip(),
            external_tip: self.engine.external_tip(),
            broadcast_enabled: self.engine.broadcast_enabled(),
            orphans: self.engine.orphan_count(),
            unconfirmed: self.index().unconfirmed_txids()?.len(),
        })
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.get_mut().take() {
            handle.abort();
        }
    }
}
