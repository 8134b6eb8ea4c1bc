//! Sliding Window Throttler
//!
//! Keys windows by pool or by resolved user id, so a user's quota covers
//! all of the user's tokens without any sibling bookkeeping.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::cache::{QuotaCache, QuotaSink};
use super::clock::Clock;
use super::config::Algorithm;
use super::error::ThrottleError;
use super::lookup::QuotaLookup;
use super::quota::{normalize_token, CounterKey, PoolKey, Quota, QuotaState};
use super::resolver::{QuotaResolver, ResolverPool};
use super::stats::{ThrottleStats, WindowSnapshot};
use super::window::WindowStore;
use super::Throttler;
use crate::metrics;

/// Sliding-window admission engine
#[derive(Debug)]
pub struct SlidingWindowThrottler {
    windows: WindowStore,
    cache: Arc<QuotaCache>,
    resolver: QuotaResolver,
    clock: Arc<dyn Clock>,
    guest: Quota,
    unresolved: Quota,
}

impl SlidingWindowThrottler {
    /// Create an engine with both pools seeded; each pool's first window
    /// opens on its first request
    pub fn new(
        guest: Quota,
        unresolved: Quota,
        lookup: Arc<dyn QuotaLookup>,
        clock: Arc<dyn Clock>,
        pool: ResolverPool,
    ) -> Self {
        let windows = WindowStore::new(clock.epoch_millis(), guest.limit(), unresolved.limit());
        let cache = Arc::new(QuotaCache::new());
        let resolver = QuotaResolver::new(cache.clone(), lookup, clock.clone(), pool);
        Self {
            windows,
            cache,
            resolver,
            clock,
            guest,
            unresolved,
        }
    }

    /// Window store
    pub fn windows(&self) -> &WindowStore {
        &self.windows
    }

    /// Resolved quotas
    pub fn cache(&self) -> &QuotaCache {
        &self.cache
    }

    fn consume_pool(&self, pool: PoolKey, now: i64) -> Result<bool, ThrottleError> {
        let limit = match pool {
            PoolKey::GuestPool => self.guest.limit(),
            PoolKey::UnresolvedAuthenticatedPool => self.unresolved.limit(),
        };
        let admitted = self.windows.consume_pool(pool, now, limit)?.is_admitted();
        metrics::record_decision(pool.as_str(), admitted);
        Ok(admitted)
    }
}

impl Throttler for SlidingWindowThrottler {
    fn is_request_allowed(&self, token: Option<&str>) -> Result<bool, ThrottleError> {
        let now = self.clock.epoch_millis();

        let Some(token) = normalize_token(token) else {
            return self.consume_pool(PoolKey::GuestPool, now);
        };

        self.resolver.resolve(token);

        match self.cache.cached_quota(token) {
            Some(quota) => {
                let admitted = self
                    .windows
                    .consume(CounterKey::user(&quota.user_id), now, quota.limit())
                    .is_admitted();
                metrics::record_decision("resolved", admitted);
                Ok(admitted)
            }
            None => self.consume_pool(PoolKey::UnresolvedAuthenticatedPool, now),
        }
    }

    fn quota_state(&self, token: &str) -> QuotaState {
        self.resolver.state(token)
    }

    fn resolver(&self) -> &QuotaResolver {
        &self.resolver
    }

    fn evict_idle(&self, idle: Duration) -> usize {
        let idle = i64::try_from(idle.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.epoch_millis().saturating_sub(idle);
        self.windows.evict_idle(cutoff)
    }

    fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            timestamp: Utc::now(),
            algorithm: Algorithm::SlidingWindow,
            counters: Vec::new(),
            windows: self
                .windows
                .entries()
                .into_iter()
                .map(|(key, window)| WindowSnapshot { key, window })
                .collect(),
            users: Vec::new(),
            pending_fetches: self.resolver.pending_tokens(),
        }
    }
}
