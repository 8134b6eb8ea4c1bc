//! Fixed-Second Throttler
//!
//! Counts requests in calendar-second buckets. Tokens without a resolved
//! quota share the unresolved pool; resolved tokens are charged to their own
//! counter and then checked against the user's quota summed over every
//! token seen for that user.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::cache::QuotaSink;
use super::clock::Clock;
use super::config::Algorithm;
use super::error::ThrottleError;
use super::lookup::QuotaLookup;
use super::quota::{normalize_token, PoolKey, Quota, QuotaState};
use super::resolver::{QuotaResolver, ResolverPool};
use super::stats::ThrottleStats;
use super::store::{CounterEntry, CounterStore};
use super::users::UserIndex;
use super::Throttler;
use crate::metrics;

/// Fixed-second admission engine
#[derive(Debug)]
pub struct FixedWindowThrottler {
    store: Arc<CounterStore>,
    users: UserIndex,
    resolver: QuotaResolver,
    clock: Arc<dyn Clock>,
}

impl FixedWindowThrottler {
    /// Create an engine with both pools seeded at the clock's current second
    pub fn new(
        guest: Quota,
        unresolved: Quota,
        lookup: Arc<dyn QuotaLookup>,
        clock: Arc<dyn Clock>,
        pool: ResolverPool,
    ) -> Self {
        let store = Arc::new(CounterStore::new(guest, unresolved, clock.epoch_second()));
        let resolver = QuotaResolver::new(store.clone(), lookup, clock.clone(), pool);
        Self {
            store,
            users: UserIndex::new(),
            resolver,
            clock,
        }
    }

    /// Counter store
    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    /// User aggregation index
    pub fn users(&self) -> &UserIndex {
        &self.users
    }

    fn consume_pool(&self, pool: PoolKey, second: i64) -> Result<bool, ThrottleError> {
        let admitted = self.store.consume_pool(pool, second)?.is_admitted();
        metrics::record_decision(pool.as_str(), admitted);
        Ok(admitted)
    }

    /// Charge a resolved token and check its user's aggregate consumption.
    /// `None` if the token's entry disappeared (evicted) in the meantime.
    fn consume_resolved(
        &self,
        token: &str,
        user_id: &str,
        second: i64,
    ) -> Result<Option<bool>, ThrottleError> {
        self.users.with_user(user_id, token, |tokens| {
            let Some(own) = self.store.consume_token(token, second) else {
                return Ok(None);
            };
            self.within_user_quota(&own, token, tokens).map(Some)
        })
    }

    /// `consumed <= max_rps`, where `consumed` sums every sibling entry reset
    /// for the current second. This is `max_rps * tokens - remaining_sum`
    /// with stale siblings counted as fully available.
    fn within_user_quota(
        &self,
        own: &CounterEntry,
        token: &str,
        tokens: &BTreeSet<String>,
    ) -> Result<bool, ThrottleError> {
        let current = own.second_id;
        let mut consumed = own.consumed_in(current);

        for sibling in tokens.iter().filter(|t| t.as_str() != token) {
            let Some(entry) = self.store.token_entry(sibling) else {
                continue;
            };
            if entry.second_id != current {
                continue;
            }
            if entry.quota != own.quota {
                return Err(ThrottleError::ConflictingQuotas {
                    user_id: own.quota.user_id.clone(),
                    first: own.quota.clone(),
                    second: entry.quota,
                });
            }
            consumed += entry.consumed_in(current);
        }

        Ok(consumed <= own.quota.limit())
    }
}

impl Throttler for FixedWindowThrottler {
    fn is_request_allowed(&self, token: Option<&str>) -> Result<bool, ThrottleError> {
        let second = self.clock.epoch_second();

        let Some(token) = normalize_token(token) else {
            return self.consume_pool(PoolKey::GuestPool, second);
        };

        self.resolver.resolve(token);

        if let Some(quota) = self.store.cached_quota(token) {
            if let Some(admitted) = self.consume_resolved(token, &quota.user_id, second)? {
                metrics::record_decision("resolved", admitted);
                return Ok(admitted);
            }
        }

        self.consume_pool(PoolKey::UnresolvedAuthenticatedPool, second)
    }

    fn quota_state(&self, token: &str) -> QuotaState {
        self.resolver.state(token)
    }

    fn resolver(&self) -> &QuotaResolver {
        &self.resolver
    }

    fn evict_idle(&self, idle: Duration) -> usize {
        let idle = i64::try_from(idle.as_secs()).unwrap_or(i64::MAX);
        let cutoff = self.clock.epoch_second().saturating_sub(idle);
        self.store.evict_idle(cutoff)
    }

    fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            timestamp: Utc::now(),
            algorithm: Algorithm::FixedSecond,
            counters: self.store.entries(),
            windows: Vec::new(),
            users: self.users.users(),
            pending_fetches: self.resolver.pending_tokens(),
        }
    }
}
