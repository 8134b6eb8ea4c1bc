//! Quota Cache
//!
//! The resolver merges resolved quotas into a [`QuotaSink`]. The fixed-second
//! engine's sink is its counter store (entries carry their quota); the
//! sliding window engine uses the plain token-to-quota [`QuotaCache`].

use dashmap::DashMap;

use super::quota::Quota;

/// Destination of resolved quotas
pub trait QuotaSink: Send + Sync + 'static {
    /// Last known quota for a token. `None` means "treat as unresolved".
    fn cached_quota(&self, token: &str) -> Option<Quota>;

    /// Merge a freshly resolved quota for a token
    fn merge_quota(&self, token: &str, quota: Quota, second: i64);
}

/// Token to quota map
#[derive(Debug, Default)]
pub struct QuotaCache {
    quotas: DashMap<String, Quota>,
}

impl QuotaCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached tokens
    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }
}

impl QuotaSink for QuotaCache {
    fn cached_quota(&self, token: &str) -> Option<Quota> {
        self.quotas.get(token).map(|q| q.value().clone())
    }

    fn merge_quota(&self, token: &str, quota: Quota, _second: i64) {
        self.quotas.insert(token.to_string(), quota);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_and_lookup() {
        let cache = QuotaCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.cached_quota("t1"), None);

        cache.merge_quota("t1", Quota::new("user-1", 8), 0);
        assert_eq!(cache.cached_quota("t1"), Some(Quota::new("user-1", 8)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_merge_replaces_quota() {
        let cache = QuotaCache::new();
        cache.merge_quota("t1", Quota::new("user-1", 8), 0);
        cache.merge_quota("t1", Quota::new("user-1", 16), 1);

        assert_eq!(cache.cached_quota("t1"), Some(Quota::new("user-1", 16)));
    }
}
