//! Subscription Registry
//!
//! Single source of truth for "is this pair already subscribed". Maps a
//! market key to the feed-consumer handle created for it.
//!
//! # Design
//!
//! The registry is generic over the handle type so the domain layer stays
//! free of port traits; the orchestrator instantiates it with
//! `Arc<dyn FeedConsumer>`. Entries are inserted only after a successful
//! handshake and removed either on handshake failure (so a retry is
//! possible) or by a full `reset()`.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::domain::market::MarketKey;

/// Thread-safe map from market key to feed-consumer handle.
#[derive(Debug)]
pub struct SubscriptionRegistry<H> {
    entries: RwLock<HashMap<MarketKey, H>>,
}

impl<H: Clone> Default for SubscriptionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone> SubscriptionRegistry<H> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the handle registered for a key.
    #[must_use]
    pub fn get(&self, key: &MarketKey) -> Option<H> {
        self.entries.read().get(key).cloned()
    }

    /// Whether a key has a registered handle.
    #[must_use]
    pub fn contains(&self, key: &MarketKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Register a handle for a key, replacing any previous entry.
    ///
    /// Returns the previous handle if one was present.
    pub fn insert(&self, key: MarketKey, handle: H) -> Option<H> {
        self.entries.write().insert(key, handle)
    }

    /// Remove the entry for a key.
    ///
    /// Returns the removed handle if one was present.
    pub fn remove(&self, key: &MarketKey) -> Option<H> {
        self.entries.write().remove(key)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the registered keys.
    #[must_use]
    pub fn keys(&self) -> Vec<MarketKey> {
        self.entries.read().keys().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> MarketKey {
        MarketKey::new(s).unwrap()
    }

    #[test]
    fn default_is_empty() {
        let registry = SubscriptionRegistry::<u32>::default();
        assert!(registry.is_empty());
    }

    #[test]
    fn insert_and_get() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.insert(key("BTC-ETH"), 7_u32).is_none());

        assert_eq!(registry.get(&key("BTC-ETH")), Some(7));
        assert!(registry.contains(&key("BTC-ETH")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_missing_returns_none() {
        let registry: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        assert_eq!(registry.get(&key("BTC-ETH")), None);
        assert!(!registry.contains(&key("BTC-ETH")));
    }

    #[test]
    fn insert_replaces_and_returns_previous() {
        let registry = SubscriptionRegistry::new();
        registry.insert(key("BTC-ETH"), 1_u32);
        assert_eq!(registry.insert(key("BTC-ETH"), 2), Some(1));
        assert_eq!(registry.get(&key("BTC-ETH")), Some(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_makes_retry_possible() {
        let registry = SubscriptionRegistry::new();
        registry.insert(key("BTC-ETH"), 1_u32);

        assert_eq!(registry.remove(&key("BTC-ETH")), Some(1));
        assert!(!registry.contains(&key("BTC-ETH")));
        assert_eq!(registry.remove(&key("BTC-ETH")), None);
    }

    #[test]
    fn clear_empties_registry() {
        let registry = SubscriptionRegistry::new();
        registry.insert(key("BTC-ETH"), 1_u32);
        registry.insert(key("BTC-LTC"), 2);

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn keys_snapshot() {
        let registry = SubscriptionRegistry::new();
        registry.insert(key("BTC-ETH"), 1_u32);
        registry.insert(key("BTC-LTC"), 2);

        let mut keys = registry.keys();
        keys.sort();
        assert_eq!(keys, vec![key("BTC-ETH"), key("BTC-LTC")]);
    }

    #[test]
    fn thread_safety_concurrent_inserts() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(SubscriptionRegistry::new());
        let mut handles = vec![];

        for i in 0..10_u32 {
            let r = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                r.insert(key(&format!("BTC-C{i}")), i);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 10);
    }
}
