//! Sliding Window Store
//!
//! Per-key rolling windows. A window opens on the first request after the
//! previous one expired and lasts [`WINDOW_MILLIS`]; its quota is fixed for
//! the window's lifetime.

use dashmap::DashMap;
use serde::Serialize;

use super::error::ThrottleError;
use super::quota::{CounterKey, PoolKey};

/// Window length
pub const WINDOW_MILLIS: i64 = 1000;

/// Window state of a single key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowEntry {
    /// Window start (epoch millis, inclusive)
    pub start_millis: i64,

    /// Window end (epoch millis, exclusive)
    pub end_millis: i64,

    /// Requests left in the window. Negative once the quota is exceeded.
    pub remaining_rps: i64,
}

impl WindowEntry {
    /// Open a window at `now` and count its first request
    pub fn open(now: i64, limit: i64) -> Self {
        Self {
            start_millis: now,
            end_millis: now + WINDOW_MILLIS,
            remaining_rps: limit - 1,
        }
    }

    /// A window that already ended at `now`; the next request opens a
    /// fresh one anchored to itself
    pub fn expired(now: i64, limit: i64) -> Self {
        Self {
            start_millis: now,
            end_millis: now,
            remaining_rps: limit,
        }
    }

    /// Count one request at `now`, opening a new window if this one ended
    pub fn consume(&mut self, now: i64, limit: i64) {
        if self.contains(now) {
            self.remaining_rps -= 1;
        } else {
            *self = Self::open(now, limit);
        }
    }

    /// Whether `now` falls inside this window
    pub fn contains(&self, now: i64) -> bool {
        now < self.end_millis
    }

    /// Whether the last counted request fits the quota
    pub fn is_admitted(&self) -> bool {
        self.remaining_rps >= 0
    }
}

/// Rolling windows keyed by pool or user
#[derive(Debug)]
pub struct WindowStore {
    windows: DashMap<CounterKey, WindowEntry>,
}

impl WindowStore {
    /// Create a store with both pool windows seeded as expired at `now`
    pub fn new(now: i64, guest_limit: i64, unresolved_limit: i64) -> Self {
        let windows = DashMap::new();
        windows.insert(
            PoolKey::GuestPool.into(),
            WindowEntry::expired(now, guest_limit),
        );
        windows.insert(
            PoolKey::UnresolvedAuthenticatedPool.into(),
            WindowEntry::expired(now, unresolved_limit),
        );
        Self { windows }
    }

    /// Count one request against a pool
    pub fn consume_pool(
        &self,
        pool: PoolKey,
        now: i64,
        limit: i64,
    ) -> Result<WindowEntry, ThrottleError> {
        let mut window = self
            .windows
            .get_mut(&CounterKey::from(pool))
            .ok_or(ThrottleError::MissingPool(pool))?;
        window.consume(now, limit);
        Ok(*window)
    }

    /// Count one request against `key` at `now`. `limit` seeds a new window
    /// and is ignored while the current window is open.
    pub fn consume(&self, key: CounterKey, now: i64, limit: i64) -> WindowEntry {
        let window = self
            .windows
            .entry(key)
            .and_modify(|window| window.consume(now, limit))
            .or_insert_with(|| WindowEntry::open(now, limit));
        *window
    }

    /// Snapshot of a key's window
    pub fn get(&self, key: &CounterKey) -> Option<WindowEntry> {
        self.windows.get(key).map(|w| *w.value())
    }

    /// Snapshot of every window
    pub fn entries(&self) -> Vec<(CounterKey, WindowEntry)> {
        let mut entries: Vec<(CounterKey, WindowEntry)> = self
            .windows
            .iter()
            .map(|w| (w.key().clone(), *w.value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of windows
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Always false: pools are never removed
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Remove non-pool windows that ended before `cutoff_millis`
    pub fn evict_idle(&self, cutoff_millis: i64) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|key, window| key.is_pool() || window.end_millis >= cutoff_millis);
        before.saturating_sub(self.windows.len())
    }

    #[cfg(test)]
    pub(crate) fn remove(&self, key: &CounterKey) -> Option<WindowEntry> {
        self.windows.remove(key).map(|(_, w)| w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_250;

    fn store() -> WindowStore {
        WindowStore::new(NOW, 3, 3)
    }

    #[test]
    fn test_pools_are_seeded() {
        let store = store();
        assert_eq!(store.len(), 2);

        let guest = store.get(&PoolKey::GuestPool.into()).unwrap();
        assert_eq!(guest.remaining_rps, 3);
        assert!(!guest.contains(NOW));
    }

    #[test]
    fn test_first_pool_request_opens_window() {
        let store = store();

        let first = store
            .consume_pool(PoolKey::GuestPool, NOW + 900, 3)
            .unwrap();
        assert_eq!(first.start_millis, NOW + 900);
        assert_eq!(first.end_millis, NOW + 900 + WINDOW_MILLIS);
        assert_eq!(first.remaining_rps, 2);

        // Still inside the window opened by the first request
        let later = store
            .consume_pool(PoolKey::GuestPool, NOW + 1500, 3)
            .unwrap();
        assert_eq!(later.start_millis, NOW + 900);
        assert_eq!(later.remaining_rps, 1);
    }

    #[test]
    fn test_first_request_opens_window() {
        let store = store();
        let window = store.consume(CounterKey::user("user-1"), NOW, 3);

        assert_eq!(window.start_millis, NOW);
        assert_eq!(window.end_millis, NOW + WINDOW_MILLIS);
        assert_eq!(window.remaining_rps, 2);
        assert!(window.is_admitted());
    }

    #[test]
    fn test_window_exhausts() {
        let store = store();
        let admitted = (0..5)
            .filter(|i| {
                store
                    .consume_pool(PoolKey::GuestPool, NOW + i * 100, 3)
                    .unwrap()
                    .is_admitted()
            })
            .count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_window_is_anchored_to_first_request() {
        let store = store();
        let key = CounterKey::user("user-1");
        for _ in 0..3 {
            store.consume(key.clone(), NOW, 3);
        }

        let rejected = store.consume(key.clone(), NOW + WINDOW_MILLIS - 1, 3);
        assert!(!rejected.is_admitted());

        let reopened = store.consume(key, NOW + WINDOW_MILLIS, 3);
        assert!(reopened.is_admitted());
        assert_eq!(reopened.start_millis, NOW + WINDOW_MILLIS);
    }

    #[test]
    fn test_limit_is_fixed_for_window_lifetime() {
        let store = store();
        let key = CounterKey::user("user-1");
        store.consume(key.clone(), NOW, 2);
        store.consume(key.clone(), NOW + 1, 100);

        let window = store.consume(key, NOW + 2, 100);
        assert!(!window.is_admitted());
    }

    #[test]
    fn test_keys_are_staggered() {
        let store = store();
        let a = store.consume(CounterKey::user("a"), NOW, 5);
        let b = store.consume(CounterKey::user("b"), NOW + 400, 5);

        assert_ne!(a.end_millis, b.end_millis);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_missing_pool_is_an_error() {
        let store = store();
        store.remove(&PoolKey::GuestPool.into());

        let err = store.consume_pool(PoolKey::GuestPool, NOW, 3).unwrap_err();
        assert!(matches!(err, ThrottleError::MissingPool(PoolKey::GuestPool)));
    }

    #[test]
    fn test_evict_idle_keeps_pools() {
        let store = WindowStore::new(NOW - 60_000, 5, 5);
        store.consume(CounterKey::user("stale"), NOW - 60_000, 5);
        store.consume(CounterKey::user("fresh"), NOW, 5);

        assert_eq!(store.evict_idle(NOW - 1_000), 1);
        assert!(store.get(&CounterKey::user("stale")).is_none());
        assert!(store.get(&CounterKey::user("fresh")).is_some());
        assert!(store.get(&PoolKey::GuestPool.into()).is_some());
        assert!(store.get(&PoolKey::UnresolvedAuthenticatedPool.into()).is_some());
    }
}
