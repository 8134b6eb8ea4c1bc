//! Counter Store
//!
//! Per-key fixed-second counters. Each key owns one [`CounterEntry`] that is
//! lazily reset the first time it is touched in a new second. Updates go
//! through `DashMap::get_mut`, which holds the key's shard lock for the whole
//! read-modify-write, so concurrent callers on one key never lose an update.

use dashmap::DashMap;
use serde::Serialize;

use super::cache::QuotaSink;
use super::error::ThrottleError;
use super::quota::{CounterKey, PoolKey, Quota};

/// Counter state of a single key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterEntry {
    /// Key this entry belongs to
    pub key: CounterKey,

    /// Epoch second the entry was last reset for
    pub second_id: i64,

    /// Quota the entry is reset to
    pub quota: Quota,

    /// Requests left in `second_id`. Negative once the quota is exceeded.
    pub remaining_rps: i64,
}

impl CounterEntry {
    /// Create an untouched entry for the given second
    pub fn new(key: CounterKey, quota: Quota, second: i64) -> Self {
        let remaining_rps = quota.limit();
        Self {
            key,
            second_id: second,
            quota,
            remaining_rps,
        }
    }

    /// Count one request made during `second`
    ///
    /// A later second resets the entry first. An earlier second (clock moved
    /// backwards) is counted against the current bucket so `second_id` never
    /// decreases.
    pub fn consume(&mut self, second: i64) {
        if second > self.second_id {
            self.second_id = second;
            self.remaining_rps = self.quota.limit() - 1;
        } else {
            self.remaining_rps -= 1;
        }
    }

    /// Whether the last counted request fits the quota
    pub fn is_admitted(&self) -> bool {
        self.remaining_rps >= 0
    }

    /// Requests counted during `second`. Entries last reset for another
    /// second count as fully available.
    pub fn consumed_in(&self, second: i64) -> i64 {
        if self.second_id == second {
            self.quota.limit() - self.remaining_rps
        } else {
            0
        }
    }
}

/// Fixed-second counters for pools and tokens
#[derive(Debug)]
pub struct CounterStore {
    entries: DashMap<CounterKey, CounterEntry>,
}

impl CounterStore {
    /// Create a store with both pools seeded
    pub fn new(guest: Quota, unresolved: Quota, second: i64) -> Self {
        let entries = DashMap::new();
        for (pool, quota) in [
            (PoolKey::GuestPool, guest),
            (PoolKey::UnresolvedAuthenticatedPool, unresolved),
        ] {
            let key = CounterKey::from(pool);
            entries.insert(key.clone(), CounterEntry::new(key, quota, second));
        }
        Self { entries }
    }

    /// Count one request against a pool
    pub fn consume_pool(&self, pool: PoolKey, second: i64) -> Result<CounterEntry, ThrottleError> {
        let mut entry = self
            .entries
            .get_mut(&CounterKey::from(pool))
            .ok_or(ThrottleError::MissingPool(pool))?;
        entry.consume(second);
        Ok(entry.clone())
    }

    /// Count one request against a token. `None` if the token has no entry,
    /// which means its quota is not resolved.
    pub fn consume_token(&self, token: &str, second: i64) -> Option<CounterEntry> {
        let mut entry = self.entries.get_mut(&CounterKey::token(token))?;
        entry.consume(second);
        Some(entry.clone())
    }

    /// Snapshot of a key's entry
    pub fn get(&self, key: &CounterKey) -> Option<CounterEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Snapshot of a token's entry
    pub fn token_entry(&self, token: &str) -> Option<CounterEntry> {
        self.get(&CounterKey::token(token))
    }

    /// Snapshot of every entry
    pub fn entries(&self) -> Vec<CounterEntry> {
        let mut entries: Vec<CounterEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Number of entries, pools included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: pools are never removed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove token entries not reset since `cutoff_second`. Pools stay.
    pub fn evict_idle(&self, cutoff_second: i64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| key.is_pool() || entry.second_id >= cutoff_second);
        before.saturating_sub(self.entries.len())
    }

    #[cfg(test)]
    pub(crate) fn remove(&self, key: &CounterKey) -> Option<CounterEntry> {
        self.entries.remove(key).map(|(_, e)| e)
    }
}

impl QuotaSink for CounterStore {
    fn cached_quota(&self, token: &str) -> Option<Quota> {
        self.entries
            .get(&CounterKey::token(token))
            .map(|e| e.quota.clone())
    }

    /// Keep the consumed value of an existing entry and only swap its quota,
    /// so resolution never refunds usage. A new limit applies from the next
    /// reset.
    fn merge_quota(&self, token: &str, quota: Quota, second: i64) {
        let key = CounterKey::token(token);
        self.entries
            .entry(key.clone())
            .and_modify(|entry| entry.quota = quota.clone())
            .or_insert_with(|| CounterEntry::new(key, quota, second));
    }
}
