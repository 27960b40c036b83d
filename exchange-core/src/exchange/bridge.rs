// exchange/bridge.rs
// ====
// Request/response correlation
// ====
// The same shape serves both layers that need it: venue calls that expect
// exactly one eventual response keyed by an echoed id, and the
// orchestrator↔worker boundary where every crossing call carries a
// request id. Unmatched or duplicate resolutions are silent no-ops; a
// resolved entry leaves the pending table so memory stays bounded.
// ====

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

pub struct ResponseBridge<K: Eq + Hash, T> {
    pending: DashMap<K, oneshot::Sender<T>>,
    next_id: AtomicU64,
}

impl<K: Eq + Hash, T> Default for ResponseBridge<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, T> ResponseBridge<K, T> {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fresh correlation id for callers that key by number.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a pending call and returns the receiver its response will
    /// arrive on. Callers needing bounded latency layer their own timeout.
    pub fn register(&self, key: K) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key, tx);
        rx
    }

    /// Resolves a pending call exactly once. Returns false (and does
    /// nothing) for unknown or already-resolved keys.
    pub fn resolve(&self, key: &K, value: T) -> bool {
        match self.pending.remove(key) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Abandons a pending call without resolving it (e.g. after a timeout).
    pub fn forget(&self, key: &K) {
        self.pending.remove(key);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl<K: Eq + Hash + Clone, T> ResponseBridge<K, T> {
    /// Resolves every pending call with a value from `make`, for when the
    /// responding side is gone for good.
    pub fn fail_all(&self, make: impl Fn() -> T) {
        let keys: Vec<K> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.resolve(&key, make());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_resolution() {
        let bridge: ResponseBridge<u64, u32> = ResponseBridge::new();
        let id = bridge.next_id();
        let rx = bridge.register(id);
        assert!(bridge.resolve(&id, 7));
        assert_eq!(rx.await.unwrap(), 7);
        assert_eq!(bridge.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_are_noops() {
        let bridge: ResponseBridge<u64, u32> = ResponseBridge::new();
        let id = bridge.next_id();
        let _rx = bridge.register(id);
        assert!(bridge.resolve(&id, 1));
        assert!(!bridge.resolve(&id, 2));
        assert!(!bridge.resolve(&99, 3));
    }

    #[tokio::test]
    async fn test_string_keys() {
        let bridge: ResponseBridge<String, &'static str> = ResponseBridge::new();
        let rx = bridge.register("auth".to_string());
        assert!(bridge.resolve(&"auth".to_string(), "ok"));
        assert_eq!(rx.await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_fail_all_drains_pending() {
        let bridge: ResponseBridge<u64, &'static str> = ResponseBridge::new();
        let a = bridge.register(1);
        let b = bridge.register(2);
        bridge.fail_all(|| "gone");
        assert_eq!(a.await.unwrap(), "gone");
        assert_eq!(b.await.unwrap(), "gone");
        assert_eq!(bridge.pending_len(), 0);
    }
}
