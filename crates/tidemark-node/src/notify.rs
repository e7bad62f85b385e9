//! Fan-out of committed index notifications to in-process subscribers.

use tokio::sync::broadcast;
use tracing::debug;

use tidemark_core::constants::EVENT_CHANNEL_CAPACITY;
use tidemark_core::notify::Notification;
use tidemark_core::traits::Notifier;

/// [`Notifier`] publishing each notification on a broadcast channel.
///
/// Slow subscribers lag and lose the oldest notifications; the index is
/// never held back by them.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Notifier for BroadcastNotifier {
    fn deliver(&self, notifications: &[Notification]) {
        for notification in notifications {
            debug!(?notification, "notify");
            // No subscribers is fine.
            let _ = self.sender.send(notification.clone());
        }
    }
}
