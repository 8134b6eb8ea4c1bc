//! Quota Lookup Collaborator
//!
//! The admission engines never talk to the quota backend directly. They hand
//! tokens to the resolver, which calls a [`QuotaLookup`] on its own worker
//! pool.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

use super::error::LookupError;
use super::quota::Quota;

/// Asynchronous quota backend
///
/// `Ok(Some(_))` is a resolved quota, `Ok(None)` means the backend has no
/// record for the token, `Err(_)` is a failed call. Calling it twice for the
/// same token must be harmless.
#[async_trait]
pub trait QuotaLookup: Send + Sync + 'static {
    /// Fetch the quota for a token
    async fn fetch_quota(&self, token: &str) -> Result<Option<Quota>, LookupError>;
}

/// Latency profile of [`StaticQuotaLookup`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LookupLatency {
    /// Answer immediately
    None,
    /// Always wait this long
    Fixed(Duration),
    /// Wait a uniformly random duration below this bound
    UpTo(Duration),
}

/// In-memory quota backend with configurable latency
#[derive(Debug, Clone)]
pub struct StaticQuotaLookup {
    quotas: HashMap<String, Quota>,
    latency: LookupLatency,
}

impl StaticQuotaLookup {
    /// Create a backend that answers from the given token map
    pub fn new(quotas: HashMap<String, Quota>) -> Self {
        Self {
            quotas,
            latency: LookupLatency::None,
        }
    }

    /// Create a backend that knows no tokens
    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    /// Set the latency profile
    pub fn with_latency(mut self, latency: LookupLatency) -> Self {
        self.latency = latency;
        self
    }

    /// Register a token
    pub fn insert(&mut self, token: impl Into<String>, quota: Quota) {
        self.quotas.insert(token.into(), quota);
    }

    /// Number of known tokens
    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    /// Whether no tokens are known
    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }

    fn delay(&self) -> Duration {
        match self.latency {
            LookupLatency::None => Duration::ZERO,
            LookupLatency::Fixed(delay) => delay,
            LookupLatency::UpTo(bound) => {
                let millis = bound.as_millis().max(1) as u64;
                Duration::from_millis(rand::rng().random_range(0..millis))
            }
        }
    }
}

#[async_trait]
impl QuotaLookup for StaticQuotaLookup {
    async fn fetch_quota(&self, token: &str) -> Result<Option<Quota>, LookupError> {
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.quotas.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup() -> StaticQuotaLookup {
        let mut lookup = StaticQuotaLookup::empty();
        lookup.insert("token-1-1", Quota::new("user-1", 8));
        lookup.insert("token-1-2", Quota::new("user-1", 8));
        lookup
    }

    #[tokio::test]
    async fn test_known_token() {
        let quota = lookup().fetch_quota("token-1-1").await.unwrap();
        assert_eq!(quota, Some(Quota::new("user-1", 8)));
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let quota = lookup().fetch_quota("nope").await.unwrap();
        assert_eq!(quota, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_latency() {
        let lookup = lookup().with_latency(LookupLatency::Fixed(Duration::from_millis(300)));
        let start = tokio::time::Instant::now();

        lookup.fetch_quota("token-1-2").await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_random_latency() {
        let lookup = lookup().with_latency(LookupLatency::UpTo(Duration::from_millis(300)));
        let start = tokio::time::Instant::now();

        lookup.fetch_quota("token-1-2").await.unwrap();

        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_len() {
        assert_eq!(lookup().len(), 2);
        assert!(StaticQuotaLookup::empty().is_empty());
    }
}
