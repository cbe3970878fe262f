//! Subscription Routing Types
//!
//! Domain types for routing tick frames from one upstream feed to many
//! downstream subscribers. Tracks which symbols each subscriber wants
//! and, inversely, which subscribers want each symbol.
//!
//! # Design
//!
//! The router maintains two indexes kept in lockstep:
//! - `subscriber_symbols`: each subscriber's current symbol set
//! - `symbol_subscribers`: the subscribers interested in each symbol
//!
//! The inverse index makes per-frame fan-out a single lookup. Upstream
//! subscriptions are reference counted through it: an upstream
//! subscribe is only warranted when a symbol gains its first subscriber,
//! and an upstream unsubscribe only when a symbol loses its last.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::stream::Symbol;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a downstream subscriber (WebSocket session or
/// the owning client's own symbol set).
pub type SubscriberId = Uuid;

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes that need to be applied upstream after a routing update.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionChanges {
    /// Symbols that gained their first subscriber.
    pub subscribe: HashSet<Symbol>,
    /// Symbols that lost their last subscriber.
    pub unsubscribe: HashSet<Symbol>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only subscribes.
    #[must_use]
    pub fn subscribe_only(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            subscribe: symbols.into_iter().collect(),
            unsubscribe: HashSet::new(),
        }
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            subscribe: HashSet::new(),
            unsubscribe: symbols.into_iter().collect(),
        }
    }

    /// Symbols to subscribe upstream, sorted for deterministic batching.
    #[must_use]
    pub fn subscribe_batch(&self) -> Vec<Symbol> {
        let mut batch: Vec<_> = self.subscribe.iter().cloned().collect();
        batch.sort();
        batch
    }

    /// Symbols to unsubscribe upstream, sorted for deterministic batching.
    #[must_use]
    pub fn unsubscribe_batch(&self) -> Vec<Symbol> {
        let mut batch: Vec<_> = self.unsubscribe.iter().cloned().collect();
        batch.sort();
        batch
    }
}

// =============================================================================
// Router State
// =============================================================================

/// The two routing indexes, only ever mutated together.
#[derive(Debug, Default)]
struct RouterState {
    /// Map from subscriber ID to their subscribed symbols.
    subscriber_symbols: HashMap<SubscriberId, HashSet<Symbol>>,
    /// Inverse map from symbol to the subscribers interested in it.
    symbol_subscribers: HashMap<Symbol, HashSet<SubscriberId>>,
}

impl RouterState {
    /// Add subscriptions for a subscriber.
    ///
    /// Returns symbols that gained their first subscriber.
    fn add(&mut self, subscriber: SubscriberId, symbols: &[Symbol]) -> Vec<Symbol> {
        let subscriber_set = self.subscriber_symbols.entry(subscriber).or_default();
        let mut new_upstream = Vec::new();

        for symbol in symbols {
            // Skip if subscriber already holds this symbol
            if subscriber_set.contains(symbol) {
                continue;
            }

            subscriber_set.insert(symbol.clone());

            let watchers = self.symbol_subscribers.entry(symbol.clone()).or_default();
            watchers.insert(subscriber);

            // First subscriber - needs upstream subscribe
            if watchers.len() == 1 {
                new_upstream.push(symbol.clone());
            }
        }

        new_upstream
    }

    /// Remove subscriptions for a subscriber.
    ///
    /// Returns symbols that lost their last subscriber.
    fn remove(&mut self, subscriber: SubscriberId, symbols: &[Symbol]) -> Vec<Symbol> {
        let Some(subscriber_set) = self.subscriber_symbols.get_mut(&subscriber) else {
            return vec![];
        };

        let mut dropped_upstream = Vec::new();

        for symbol in symbols {
            // Skip if subscriber wasn't holding this symbol
            if !subscriber_set.remove(symbol) {
                continue;
            }

            if let Some(watchers) = self.symbol_subscribers.get_mut(symbol) {
                watchers.remove(&subscriber);

                // Last subscriber removed - needs upstream unsubscribe
                if watchers.is_empty() {
                    self.symbol_subscribers.remove(symbol);
                    dropped_upstream.push(symbol.clone());
                }
            }
        }

        // Clean up empty subscriber entry
        if subscriber_set.is_empty() {
            self.subscriber_symbols.remove(&subscriber);
        }

        dropped_upstream
    }

    /// Replace a subscriber's symbol set with a desired set.
    ///
    /// Returns the upstream changes implied by the diff.
    fn set(&mut self, subscriber: SubscriberId, desired: &HashSet<Symbol>) -> SubscriptionChanges {
        let current = self
            .subscriber_symbols
            .get(&subscriber)
            .cloned()
            .unwrap_or_default();

        let to_add: Vec<Symbol> = desired.difference(&current).cloned().collect();
        let to_remove: Vec<Symbol> = current.difference(desired).cloned().collect();

        SubscriptionChanges {
            subscribe: self.add(subscriber, &to_add).into_iter().collect(),
            unsubscribe: self.remove(subscriber, &to_remove).into_iter().collect(),
        }
    }

    /// Remove all subscriptions for a subscriber.
    ///
    /// Returns symbols that lost their last subscriber.
    fn remove_subscriber(&mut self, subscriber: SubscriberId) -> Vec<Symbol> {
        let Some(subscriber_set) = self.subscriber_symbols.remove(&subscriber) else {
            return vec![];
        };

        let mut dropped_upstream = Vec::new();

        for symbol in &subscriber_set {
            if let Some(watchers) = self.symbol_subscribers.get_mut(symbol) {
                watchers.remove(&subscriber);

                if watchers.is_empty() {
                    self.symbol_subscribers.remove(symbol);
                    dropped_upstream.push(symbol.clone());
                }
            }
        }

        dropped_upstream
    }

    /// Get the subscribers interested in a symbol.
    fn subscribers_for(&self, symbol: &str) -> Vec<SubscriberId> {
        self.symbol_subscribers
            .get(symbol)
            .map(|watchers| watchers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Get all symbols with at least one subscriber.
    fn active_symbols(&self) -> Vec<Symbol> {
        self.symbol_subscribers.keys().cloned().collect()
    }

    /// Get symbols for a specific subscriber.
    fn subscriber_symbols(&self, subscriber: SubscriberId) -> Vec<Symbol> {
        self.subscriber_symbols
            .get(&subscriber)
            .map(|symbols| symbols.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn symbol_count(&self) -> usize {
        self.symbol_subscribers.len()
    }

    fn subscriber_count(&self) -> usize {
        self.subscriber_symbols.len()
    }
}

// =============================================================================
// Subscription Router
// =============================================================================

/// Routes symbols between downstream subscribers and the upstream feed.
///
/// Thread-safe router that tracks:
/// - Per-subscriber symbol sets
/// - The inverse symbol-to-subscribers index used for fan-out
/// - Which updates require an upstream subscribe or unsubscribe
///
/// # Example
///
/// ```rust
/// use feed_gateway::domain::subscription::SubscriptionRouter;
/// use uuid::Uuid;
///
/// let router = SubscriptionRouter::new();
/// let first = Uuid::new_v4();
/// let second = Uuid::new_v4();
///
/// // First subscriber to AAPL triggers an upstream subscribe
/// let changes = router.add_subscriptions(first, &["AAPL".to_string()]);
/// assert!(changes.subscribe.contains("AAPL"));
///
/// // Second subscriber rides the existing upstream subscription
/// let changes = router.add_subscriptions(second, &["AAPL".to_string()]);
/// assert!(changes.subscribe.is_empty());
///
/// // First subscriber leaving changes nothing upstream
/// let changes = router.remove_subscriptions(first, &["AAPL".to_string()]);
/// assert!(changes.unsubscribe.is_empty());
///
/// // Last subscriber leaving triggers the upstream unsubscribe
/// let changes = router.remove_subscriptions(second, &["AAPL".to_string()]);
/// assert!(changes.unsubscribe.contains("AAPL"));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    state: RwLock<RouterState>,
}

impl SubscriptionRouter {
    /// Create a new subscription router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
        }
    }

    /// Add subscriptions for a subscriber.
    ///
    /// Returns changes that need to be applied upstream.
    pub fn add_subscriptions(
        &self,
        subscriber: SubscriberId,
        symbols: &[Symbol],
    ) -> SubscriptionChanges {
        let new_symbols = self.state.write().add(subscriber, symbols);
        SubscriptionChanges::subscribe_only(new_symbols)
    }

    /// Remove subscriptions for a subscriber.
    ///
    /// Returns changes that need to be applied upstream.
    pub fn remove_subscriptions(
        &self,
        subscriber: SubscriberId,
        symbols: &[Symbol],
    ) -> SubscriptionChanges {
        let dropped = self.state.write().remove(subscriber, symbols);
        SubscriptionChanges::unsubscribe_only(dropped)
    }

    /// Replace a subscriber's symbol set with a desired set.
    ///
    /// This is the declarative form used by downstream interest
    /// messages: the submitted list replaces whatever the subscriber
    /// held before, and the returned changes capture the diff.
    pub fn set_subscriptions(
        &self,
        subscriber: SubscriberId,
        desired: &HashSet<Symbol>,
    ) -> SubscriptionChanges {
        self.state.write().set(subscriber, desired)
    }

    /// Handle subscriber disconnection.
    ///
    /// Removes all subscriptions for the subscriber and returns changes
    /// that need to be applied upstream.
    pub fn subscriber_disconnected(&self, subscriber: SubscriberId) -> SubscriptionChanges {
        let dropped = self.state.write().remove_subscriber(subscriber);
        SubscriptionChanges::unsubscribe_only(dropped)
    }

    /// Get the subscribers interested in a symbol.
    #[must_use]
    pub fn subscribers_for(&self, symbol: &str) -> Vec<SubscriberId> {
        self.state.read().subscribers_for(symbol)
    }

    /// Get all symbols with at least one subscriber, sorted so batched
    /// resubscribes are deterministic.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let mut symbols = self.state.read().active_symbols();
        symbols.sort();
        symbols
    }

    /// Get symbols for a specific subscriber.
    #[must_use]
    pub fn subscriber_symbols(&self, subscriber: SubscriberId) -> Vec<Symbol> {
        self.state.read().subscriber_symbols(subscriber)
    }

    /// Get routing statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let state = self.state.read();
        RouterStats {
            symbol_count: state.symbol_count(),
            subscriber_count: state.subscriber_count(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Routing statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    /// Number of symbols with at least one subscriber.
    pub symbol_count: usize,
    /// Number of subscribers with at least one symbol.
    pub subscriber_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(names: &[&str]) -> Vec<Symbol> {
        names.iter().map(ToString::to_string).collect()
    }

    fn symbol_set(names: &[&str]) -> HashSet<Symbol> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn add_subscription_new_symbol() {
        let router = SubscriptionRouter::new();

        let changes = router.add_subscriptions(Uuid::new_v4(), &symbols(&["AAPL"]));

        assert!(changes.subscribe.contains("AAPL"));
        assert!(changes.unsubscribe.is_empty());
    }

    #[test]
    fn add_subscription_existing_symbol() {
        let router = SubscriptionRouter::new();

        router.add_subscriptions(Uuid::new_v4(), &symbols(&["AAPL"]));

        // Second subscriber - no upstream change needed
        let changes = router.add_subscriptions(Uuid::new_v4(), &symbols(&["AAPL"]));

        assert!(changes.subscribe.is_empty());
        assert!(changes.unsubscribe.is_empty());
    }

    #[test]
    fn add_subscription_duplicate_subscriber() {
        let router = SubscriptionRouter::new();
        let subscriber = Uuid::new_v4();

        router.add_subscriptions(subscriber, &symbols(&["AAPL"]));

        // Same subscriber adds same symbol again
        let changes = router.add_subscriptions(subscriber, &symbols(&["AAPL"]));

        assert!(changes.subscribe.is_empty());
    }

    #[test]
    fn remove_subscription_with_remaining_subscribers() {
        let router = SubscriptionRouter::new();
        let first = Uuid::new_v4();

        router.add_subscriptions(first, &symbols(&["AAPL"]));
        router.add_subscriptions(Uuid::new_v4(), &symbols(&["AAPL"]));

        // First leaves - second still holds AAPL
        let changes = router.remove_subscriptions(first, &symbols(&["AAPL"]));

        assert!(changes.unsubscribe.is_empty());
    }

    #[test]
    fn remove_subscription_last_subscriber() {
        let router = SubscriptionRouter::new();
        let subscriber = Uuid::new_v4();

        router.add_subscriptions(subscriber, &symbols(&["AAPL"]));

        let changes = router.remove_subscriptions(subscriber, &symbols(&["AAPL"]));

        assert!(changes.unsubscribe.contains("AAPL"));
    }

    #[test]
    fn set_subscriptions_replaces_interest() {
        let router = SubscriptionRouter::new();
        let subscriber = Uuid::new_v4();

        router.set_subscriptions(subscriber, &symbol_set(&["AAPL", "MSFT"]));

        // Declaring a new list replaces the old one
        let changes = router.set_subscriptions(subscriber, &symbol_set(&["MSFT", "GOOG"]));

        assert!(changes.subscribe.contains("GOOG"));
        assert!(changes.unsubscribe.contains("AAPL"));
        assert!(!changes.subscribe.contains("MSFT"));
        assert!(!changes.unsubscribe.contains("MSFT"));
    }

    #[test]
    fn set_subscriptions_empty_clears_subscriber() {
        let router = SubscriptionRouter::new();
        let subscriber = Uuid::new_v4();

        router.set_subscriptions(subscriber, &symbol_set(&["AAPL"]));
        let changes = router.set_subscriptions(subscriber, &HashSet::new());

        assert!(changes.unsubscribe.contains("AAPL"));
        assert_eq!(router.stats().subscriber_count, 0);
    }

    #[test]
    fn set_subscriptions_shared_symbol_stays_active() {
        let router = SubscriptionRouter::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        router.set_subscriptions(first, &symbol_set(&["AAPL"]));
        router.set_subscriptions(second, &symbol_set(&["AAPL"]));

        // First drops AAPL; second still holds it
        let changes = router.set_subscriptions(first, &HashSet::new());

        assert!(changes.unsubscribe.is_empty());
        assert_eq!(router.active_symbols(), symbols(&["AAPL"]));
    }

    #[test]
    fn subscriber_disconnected_cleans_up() {
        let router = SubscriptionRouter::new();
        let subscriber = Uuid::new_v4();

        router.add_subscriptions(subscriber, &symbols(&["AAPL", "MSFT"]));

        let changes = router.subscriber_disconnected(subscriber);

        assert!(changes.unsubscribe.contains("AAPL"));
        assert!(changes.unsubscribe.contains("MSFT"));
        assert_eq!(router.stats().subscriber_count, 0);
        assert_eq!(router.stats().symbol_count, 0);
    }

    #[test]
    fn subscriber_disconnected_preserves_other_subscribers() {
        let router = SubscriptionRouter::new();
        let first = Uuid::new_v4();

        router.add_subscriptions(first, &symbols(&["AAPL"]));
        router.add_subscriptions(Uuid::new_v4(), &symbols(&["AAPL"]));

        let changes = router.subscriber_disconnected(first);

        // AAPL should NOT be unsubscribed since the second subscriber holds it
        assert!(changes.unsubscribe.is_empty());
        assert_eq!(router.active_symbols(), symbols(&["AAPL"]));
    }

    #[test]
    fn subscribers_for_returns_interested() {
        let router = SubscriptionRouter::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        router.add_subscriptions(first, &symbols(&["AAPL", "MSFT"]));
        router.add_subscriptions(second, &symbols(&["AAPL"]));

        let watchers = router.subscribers_for("AAPL");
        assert_eq!(watchers.len(), 2);
        assert!(watchers.contains(&first));
        assert!(watchers.contains(&second));

        let watchers = router.subscribers_for("MSFT");
        assert_eq!(watchers, vec![first]);
    }

    #[test]
    fn subscribers_for_unknown_symbol_empty() {
        let router = SubscriptionRouter::new();
        assert!(router.subscribers_for("AAPL").is_empty());
    }

    #[test]
    fn active_symbols_sorted() {
        let router = SubscriptionRouter::new();

        router.add_subscriptions(Uuid::new_v4(), &symbols(&["MSFT", "AAPL", "GOOG"]));

        assert_eq!(router.active_symbols(), symbols(&["AAPL", "GOOG", "MSFT"]));
    }

    #[test]
    fn remove_nonexistent_subscription_no_changes() {
        let router = SubscriptionRouter::new();

        let changes = router.remove_subscriptions(Uuid::new_v4(), &symbols(&["AAPL"]));

        assert!(changes.is_empty());
    }

    #[test]
    fn remove_subscription_from_unknown_subscriber() {
        let router = SubscriptionRouter::new();

        router.add_subscriptions(Uuid::new_v4(), &symbols(&["AAPL"]));

        // A subscriber that never subscribed removes AAPL
        let changes = router.remove_subscriptions(Uuid::new_v4(), &symbols(&["AAPL"]));

        assert!(changes.is_empty());
        assert_eq!(router.active_symbols().len(), 1);
    }

    #[test]
    fn add_partially_existing_symbols() {
        let router = SubscriptionRouter::new();

        router.add_subscriptions(Uuid::new_v4(), &symbols(&["AAPL"]));

        // Only MSFT needs an upstream subscribe; AAPL is already active
        let changes = router.add_subscriptions(Uuid::new_v4(), &symbols(&["AAPL", "MSFT"]));

        assert_eq!(changes.subscribe.len(), 1);
        assert!(changes.subscribe.contains("MSFT"));
    }

    #[test]
    fn stats_are_accurate() {
        let router = SubscriptionRouter::new();

        router.add_subscriptions(Uuid::new_v4(), &symbols(&["AAPL", "MSFT"]));
        router.add_subscriptions(Uuid::new_v4(), &symbols(&["AAPL"]));

        let stats = router.stats();

        assert_eq!(stats.symbol_count, 2); // AAPL and MSFT
        assert_eq!(stats.subscriber_count, 2);
    }

    #[test]
    fn subscription_changes_batches_sorted() {
        let changes = SubscriptionChanges::subscribe_only(symbols(&["MSFT", "AAPL"]));
        assert_eq!(changes.subscribe_batch(), symbols(&["AAPL", "MSFT"]));

        let changes = SubscriptionChanges::unsubscribe_only(symbols(&["MSFT", "AAPL"]));
        assert_eq!(changes.unsubscribe_batch(), symbols(&["AAPL", "MSFT"]));
    }

    #[test]
    fn subscription_changes_is_empty() {
        let empty = SubscriptionChanges::default();
        assert!(empty.is_empty());

        let subscribe_only = SubscriptionChanges::subscribe_only(symbols(&["AAPL"]));
        assert!(!subscribe_only.is_empty());

        let unsubscribe_only = SubscriptionChanges::unsubscribe_only(symbols(&["AAPL"]));
        assert!(!unsubscribe_only.is_empty());
    }

    #[test]
    fn thread_safety_concurrent_subscriptions() {
        use std::sync::Arc;
        use std::thread;

        let router = Arc::new(SubscriptionRouter::new());
        let mut handles = vec![];

        // Spawn 10 threads that each add subscriptions
        for i in 0..10 {
            let r = Arc::clone(&router);
            handles.push(thread::spawn(move || {
                r.add_subscriptions(
                    Uuid::new_v4(),
                    &[format!("SYM{i}"), "SHARED".to_string()],
                );
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        // All 10 subscribers should have registered
        let stats = router.stats();
        assert_eq!(stats.subscriber_count, 10);
        // 10 unique symbols (SYM0-SYM9) + 1 shared = 11
        assert_eq!(stats.symbol_count, 11);
        assert_eq!(router.subscribers_for("SHARED").len(), 10);
    }

    #[test]
    fn thread_safety_concurrent_disconnects() {
        use std::sync::Arc;
        use std::thread;

        let router = Arc::new(SubscriptionRouter::new());

        // Set up subscriptions first
        let subscribers: Vec<SubscriberId> = (0..10).map(|_| Uuid::new_v4()).collect();
        for subscriber in &subscribers {
            router.add_subscriptions(*subscriber, &symbols(&["SHARED"]));
        }

        let mut handles = vec![];

        // Spawn threads to disconnect concurrently
        for subscriber in subscribers {
            let r = Arc::clone(&router);
            handles.push(thread::spawn(move || {
                r.subscriber_disconnected(subscriber);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        // All subscribers should be gone
        let stats = router.stats();
        assert_eq!(stats.subscriber_count, 0);
        assert_eq!(stats.symbol_count, 0);
    }
}
