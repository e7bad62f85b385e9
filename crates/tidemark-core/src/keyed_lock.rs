//! Mutual exclusion over sets of keys, with a global exclusive mode.
//!
//! Keyed holders own a set of keys; two holders never own overlapping
//! sets. An exclusive holder owns everything. Waiters are queued by
//! ticket: a keyed request only waits behind earlier requests that share
//! a key, or behind an earlier exclusive request, so unrelated keys make
//! progress independently while a pending exclusive request stops new
//! keyed holders from overtaking it.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// What a queued ticket is waiting for.
enum Request<K> {
    Keys(HashSet<K>),
    Exclusive,
}

struct LockState<K> {
    held: HashSet<K>,
    keyed_holders: usize,
    exclusive: bool,
    waiting: BTreeMap<u64, Request<K>>,
    next_ticket: u64,
}

impl<K: Hash + Eq> LockState<K> {
    fn can_grant_keys(&self, ticket: u64, keys: &HashSet<K>) -> bool {
        if self.exclusive || !self.held.is_disjoint(keys) {
            return false;
        }
        self.waiting.range(..ticket).all(|(_, earlier)| match earlier {
            Request::Keys(other) => other.is_disjoint(keys),
            Request::Exclusive => false,
        })
    }

    fn can_grant_exclusive(&self, ticket: u64) -> bool {
        !self.exclusive
            && self.keyed_holders == 0
            && self.waiting.range(..ticket).next().is_none()
    }
}

/// An asynchronous lock over sets of keys of type `K`.
pub struct KeyedLock<K> {
    state: Mutex<LockState<K>>,
    released: Notify,
}

impl<K: Hash + Eq + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                held: HashSet::new(),
                keyed_holders: 0,
                exclusive: false,
                waiting: BTreeMap::new(),
                next_ticket: 0,
            }),
            released: Notify::new(),
        }
    }

    fn enqueue(&self, request: Request<K>) -> Ticket<'_, K> {
        let mut state = self.state.lock();
        let id = state.next_ticket;
        state.next_ticket += 1;
        state.waiting.insert(id, request);
        Ticket { lock: self, id, armed: true }
    }

    /// Wait until `keys` are free, then hold them until the guard drops.
    pub async fn lock_keys<I>(&self, keys: I) -> KeyedGuard<'_, K>
    where
        I: IntoIterator<Item = K>,
    {
        let keys: HashSet<K> = keys.into_iter().collect();
        let mut ticket = self.enqueue(Request::Keys(keys.clone()));
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.can_grant_keys(ticket.id, &keys) {
                    state.waiting.remove(&ticket.id);
                    state.held.extend(keys.iter().cloned());
                    state.keyed_holders += 1;
                    ticket.armed = false;
                    return KeyedGuard { lock: self, keys };
                }
            }
            notified.await;
        }
    }

    /// Wait until no other holder exists, then hold the whole key space
    /// until the guard drops.
    pub async fn lock_exclusive(&self) -> ExclusiveGuard<'_, K> {
        let mut ticket = self.enqueue(Request::Exclusive);
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.can_grant_exclusive(ticket.id) {
                    state.waiting.remove(&ticket.id);
                    state.exclusive = true;
                    ticket.armed = false;
                    return ExclusiveGuard { lock: self };
                }
            }
            notified.await;
        }
    }

    /// Run `fut` while holding `keys`. The keys are released when `fut`
    /// finishes, fails, or is dropped.
    pub async fn with_keys<I, F, T>(&self, keys: I, fut: F) -> T
    where
        I: IntoIterator<Item = K>,
        F: Future<Output = T>,
    {
        let _guard = self.lock_keys(keys).await;
        fut.await
    }

    /// Run `fut` while holding the exclusive lock.
    pub async fn with_exclusive<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock_exclusive().await;
        fut.await
    }

    /// Number of requests currently queued.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Whether an exclusive holder is active.
    pub fn is_exclusive(&self) -> bool {
        self.state.lock().exclusive
    }
}

/// A queued request. Dropping it before it is granted (a cancelled
/// acquisition) removes it from the queue so it blocks no one.
struct Ticket<'a, K: Hash + Eq + Clone> {
    lock: &'a KeyedLock<K>,
    id: u64,
    armed: bool,
}

impl<K: Hash + Eq + Clone> Drop for Ticket<'_, K> {
    fn drop(&mut self) {
        if self.armed {
            self.lock.state.lock().waiting.remove(&self.id);
            self.lock.released.notify_waiters();
        }
    }
}

/// Holds a set of keys; releases them on drop.
pub struct KeyedGuard<'a, K: Hash + Eq + Clone> {
    lock: &'a KeyedLock<K>,
    keys: HashSet<K>,
}

impl<K: Hash + Eq + Clone> KeyedGuard<'_, K> {
    pub fn keys(&self) -> &HashSet<K> {
        &self.keys
    }
}

impl<K: Hash + Eq + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        {
            let mut state = self.lock.state.lock();
            for key in &self.keys {
                state.held.remove(key);
            }
            state.keyed_holders -= 1;
        }
        self.lock.released.notify_waiters();
    }
}

/// Holds the exclusive lock; releases it on drop.
pub struct ExclusiveGuard<'a, K: Hash + Eq + Clone> {
    lock: &'a KeyedLock<K>,
}

impl<K: Hash + Eq + Clone> Drop for ExclusiveGuard<'_, K> {
    fn drop(&mut self) {
        self.lock.state.lock().exclusive = false;
        self.lock.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn disjoint_keys_overlap() {
        let lock = Arc::new(KeyedLock::new());
        let (held_tx, held_rx) = oneshot::channel::<()>();
        let (tx, rx) = oneshot::channel::<()>();

        let l = lock.clone();
        let first = tokio::spawn(async move {
            l.with_keys(["a"], async move {
                held_tx.send(()).unwrap();
                rx.await.unwrap();
            })
            .await
        });
        held_rx.await.unwrap();

        // Would deadlock if "b" waited for "a" to release.
        lock.with_keys(["b"], async {}).await;
        tx.send(()).unwrap();
        first.await.unwrap();
    }

    #[tokio::test]
    async fn shared_keys_never_overlap() {
        let lock = Arc::new(KeyedLock::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let (lock, active, max) = (lock.clone(), active.clone(), max.clone());
            tasks.push(tokio::spawn(async move {
                let keys = vec!["shared".to_string(), format!("own-{i}")];
                lock.with_keys(keys, async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exclusive_waits_for_keyed_holders() {
        let lock = Arc::new(KeyedLock::new());
        let guard = lock.lock_keys([1u32]).await;

        let l = lock.clone();
        let exclusive = tokio::spawn(async move {
            let _g = l.lock_exclusive().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!exclusive.is_finished());

        drop(guard);
        exclusive.await.unwrap();
        assert!(!lock.is_exclusive());
    }

    #[tokio::test]
    async fn pending_exclusive_blocks_new_keyed() {
        let lock = Arc::new(KeyedLock::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let guard = lock.lock_keys([1u32]).await;

        let (l, o) = (lock.clone(), order.clone());
        let exclusive = tokio::spawn(async move {
            l.with_exclusive(async { o.lock().push("exclusive") }).await
        });
        while lock.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        // Disjoint from the held key, but queued behind the exclusive request.
        let (l, o) = (lock.clone(), order.clone());
        let keyed = tokio::spawn(async move {
            l.with_keys([2u32], async { o.lock().push("keyed") }).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(order.lock().is_empty());

        drop(guard);
        exclusive.await.unwrap();
        keyed.await.unwrap();
        assert_eq!(*order.lock(), vec!["exclusive", "keyed"]);
    }

    #[tokio::test]
    async fn keys_released_after_error() {
        let lock: KeyedLock<&str> = KeyedLock::new();
        let result: Result<(), &str> = lock.with_keys(["k"], async { Err("boom") }).await;
        assert!(result.is_err());
        // Key is free again.
        let guard = lock.lock_keys(["k"]).await;
        assert!(guard.keys().contains("k"));
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_queue() {
        let lock = Arc::new(KeyedLock::new());
        let guard = lock.lock_keys(["x"]).await;

        let l = lock.clone();
        let waiter = tokio::spawn(async move {
            let _g = l.lock_exclusive().await;
        });
        while lock.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(lock.waiting(), 0);

        // The aborted exclusive request no longer blocks keyed acquisitions.
        lock.with_keys(["y"], async {}).await;
        drop(guard);
    }
}
