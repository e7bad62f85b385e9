//! Tuning knobs for the sync engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use tidemark_core::constants::{
    BROADCAST_DISTANCE, EVENT_CHANNEL_CAPACITY, MEMPOOL_REMOVAL_BATCH, MEMPOOL_RETRY_BACKOFF_MS,
    NetworkType, SYNC_RETRY_BACKOFF_MS, TIP_REFRESH_BACKOFF_MS, TX_IMPORT_CONCURRENCY,
};

/// Sync engine configuration.
///
/// Deserializable so it can be embedded as the `[sync]` section of the
/// node configuration; every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Network used for address derivation.
    pub network: NetworkType,
    /// Fan out per-event notifications only while within this many blocks
    /// of the external tip.
    pub broadcast_distance: u64,
    /// Maximum concurrent unconfirmed-transaction imports.
    pub tx_import_concurrency: usize,
    /// Txids removed per storage transaction during mempool reconciliation.
    pub removal_batch_size: usize,
    /// Delay before retrying a failed sync iteration.
    pub retry_backoff_ms: u64,
    /// Delay between attempts to re-read the local tip after an error.
    pub tip_refresh_backoff_ms: u64,
    /// Delay before retrying a failed mempool reconciliation.
    pub mempool_retry_backoff_ms: u64,
    /// Capacity of the outbound event channel.
    pub event_capacity: usize,
    /// Resend stale unconfirmed transactions upstream on startup and on
    /// reconnect before dropping them.
    pub resubmit: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            network: NetworkType::Mainnet,
            broadcast_distance: BROADCAST_DISTANCE,
            tx_import_concurrency: TX_IMPORT_CONCURRENCY,
            removal_batch_size: MEMPOOL_REMOVAL_BATCH,
            retry_backoff_ms: SYNC_RETRY_BACKOFF_MS,
            tip_refresh_backoff_ms: TIP_REFRESH_BACKOFF_MS,
            mempool_retry_backoff_ms: MEMPOOL_RETRY_BACKOFF_MS,
            event_capacity: EVENT_CHANNEL_CAPACITY,
            resubmit: true,
        }
    }
}

impl SyncConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn tip_refresh_backoff(&self) -> Duration {
        Duration::from_millis(self.tip_refresh_backoff_ms)
    }

    pub fn mempool_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.mempool_retry_backoff_ms)
    }

    /// Whether per-event notifications should be emitted for a block at
    /// `local_height` while the external chain is at `external_height`.
    pub fn broadcast_enabled(&self, local_height: u64, external_height: u64) -> bool {
        local_height.saturating_add(self.broadcast_distance) > external_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.tx_import_concurrency, 10);
        assert_eq!(config.removal_batch_size, 250);
        assert_eq!(config.mempool_retry_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn broadcast_only_near_tip() {
        let config = SyncConfig::default();
        assert!(config.broadcast_enabled(10, 11));
        assert!(config.broadcast_enabled(500, 599));
        assert!(!config.broadcast_enabled(500, 600));
        assert!(!config.broadcast_enabled(0, 800_000));
    }

    #[test]
    fn partial_section_fills_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"network":"regtest","removal_batch_size":10}"#).unwrap();
        assert_eq!(config.network, NetworkType::Regtest);
        assert_eq!(config.removal_batch_size, 10);
        assert_eq!(config.broadcast_distance, BROADCAST_DISTANCE);
        assert!(config.resubmit);
    }
}
