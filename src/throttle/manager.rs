//! Throttle Manager
//!
//! Builds the configured admission engine and owns its background work.

use anyhow::{Context, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::config::{Algorithm, ThrottleConfig};
use super::error::ThrottleError;
use super::fixed::FixedWindowThrottler;
use super::lookup::QuotaLookup;
use super::quota::{Quota, QuotaState};
use super::resolver::ResolverPool;
use super::sliding::SlidingWindowThrottler;
use super::stats::ThrottleStats;
use super::Throttler;
use crate::metrics;

/// Throttle manager
#[derive(Debug)]
pub struct ThrottleManager {
    /// Configuration
    config: ThrottleConfig,

    /// Admission engine
    engine: Arc<dyn Throttler>,

    /// Idle eviction task
    sweeper: Option<JoinHandle<()>>,
}

impl ThrottleManager {
    /// Create a manager with a dedicated resolver runtime and the system clock
    pub fn new(config: ThrottleConfig, lookup: Arc<dyn QuotaLookup>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid throttle configuration: {}", e))?;
        let pool = ResolverPool::new(config.resolver_threads, config.max_in_flight)
            .context("Failed to start quota resolver runtime")?;
        Ok(Self::with_parts(config, lookup, Arc::new(SystemClock), pool))
    }

    /// Create a manager from explicit collaborators
    pub fn with_parts(
        config: ThrottleConfig,
        lookup: Arc<dyn QuotaLookup>,
        clock: Arc<dyn Clock>,
        pool: ResolverPool,
    ) -> Self {
        let guest = Quota::guest(config.guest_rps);
        let unresolved = Quota::unresolved(config.unresolved_rps);
        let engine: Arc<dyn Throttler> = match config.algorithm {
            Algorithm::FixedSecond => Arc::new(FixedWindowThrottler::new(
                guest, unresolved, lookup, clock, pool,
            )),
            Algorithm::SlidingWindow => Arc::new(SlidingWindowThrottler::new(
                guest, unresolved, lookup, clock, pool,
            )),
        };
        info!(
            algorithm = %config.algorithm,
            guest_rps = config.guest_rps,
            unresolved_rps = config.unresolved_rps,
            "Throttle manager started"
        );
        Self::from_engine(config, engine)
    }

    pub(crate) fn from_engine(config: ThrottleConfig, engine: Arc<dyn Throttler>) -> Self {
        let sweeper = config.idle_ttl().map(|ttl| {
            spawn_sweeper(engine.resolver().pool(), Arc::downgrade(&engine), ttl)
        });
        Self {
            config,
            engine,
            sweeper,
        }
    }

    /// Decide one request
    pub fn is_request_allowed(&self, token: Option<&str>) -> Result<bool, ThrottleError> {
        self.engine.is_request_allowed(token)
    }

    /// Decide one request, rejecting on any throttle error
    pub fn admit(&self, token: Option<&str>) -> bool {
        match self.engine.is_request_allowed(token) {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!(error = %e, "Rejecting request on throttle error");
                metrics::record_decision("error", false);
                false
            }
        }
    }

    /// Resolution state of a token
    pub fn quota_state(&self, token: &str) -> QuotaState {
        self.engine.quota_state(token)
    }

    /// Snapshot of the engine's state
    pub fn stats(&self) -> ThrottleStats {
        self.engine.stats()
    }

    /// Run one eviction pass now. Returns 0 when no idle TTL is configured.
    pub fn sweep_idle(&self) -> usize {
        match self.config.idle_ttl() {
            Some(ttl) => sweep(self.engine.as_ref(), ttl),
            None => 0,
        }
    }

    /// Wait until the token's in-flight lookup (if any) has been merged
    pub async fn wait_settled(&self, token: &str) {
        self.engine.resolver().wait_settled(token).await;
    }

    /// Wait until every in-flight lookup has been merged
    pub async fn wait_idle(&self) {
        self.engine.resolver().wait_idle().await;
    }

    /// Active configuration
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Active algorithm
    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    /// Pool the resolver runs on
    pub fn pool(&self) -> &ResolverPool {
        self.engine.resolver().pool()
    }
}

impl Drop for ThrottleManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

fn sweep(engine: &dyn Throttler, ttl: Duration) -> usize {
    let evicted = engine.evict_idle(ttl);
    if evicted > 0 {
        metrics::EVICTED_ENTRIES_TOTAL.inc_by(evicted as u64);
        debug!(evicted, "Evicted idle counters");
    }
    evicted
}

fn spawn_sweeper(pool: &ResolverPool, engine: Weak<dyn Throttler>, ttl: Duration) -> JoinHandle<()> {
    let period = ttl.max(Duration::from_secs(1));

    pool.handle().spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(engine) = engine.upgrade() else {
                break;
            };
            sweep(engine.as_ref(), ttl);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::clock::ManualClock;
    use crate::throttle::lookup::{LookupLatency, StaticQuotaLookup};
    use crate::throttle::quota::PoolKey;
    use crate::throttle::testing::{stub_lookup, TOKEN_1_1, TOKEN_2_1};
    use tokio::runtime::Handle;

    fn manager(config: ThrottleConfig, clock: Arc<ManualClock>) -> ThrottleManager {
        ThrottleManager::with_parts(
            config,
            Arc::new(stub_lookup(LookupLatency::None)),
            clock,
            ResolverPool::from_handle(Handle::current(), 4),
        )
    }

    #[tokio::test]
    async fn test_fixed_manager() {
        let clock = Arc::new(ManualClock::starting_now());
        let manager = manager(ThrottleConfig::default(), clock);
        assert_eq!(manager.algorithm(), Algorithm::FixedSecond);

        assert!(manager.admit(Some(TOKEN_1_1)));
        assert_eq!(manager.quota_state(TOKEN_1_1), QuotaState::Pending);
        manager.wait_settled(TOKEN_1_1).await;

        assert_eq!(
            manager.quota_state(TOKEN_1_1),
            QuotaState::Resolved(Quota::new("User1", 8))
        );
        assert_eq!(manager.stats().counters.len(), 3);
    }

    #[tokio::test]
    async fn test_sliding_manager() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = ThrottleConfig {
            algorithm: Algorithm::SlidingWindow,
            guest_rps: 2,
            ..ThrottleConfig::default()
        };
        let manager = manager(config, clock);

        let admitted = (0..5).filter(|_| manager.admit(None)).count();
        assert_eq!(admitted, 2);
        assert_eq!(manager.stats().algorithm, Algorithm::SlidingWindow);
    }

    #[tokio::test]
    async fn test_admit_rejects_on_error() {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = FixedWindowThrottler::new(
            Quota::guest(20),
            Quota::unresolved(20),
            Arc::new(StaticQuotaLookup::empty()),
            clock,
            ResolverPool::from_handle(Handle::current(), 1),
        );
        engine.store().remove(&PoolKey::GuestPool.into());
        let manager = ThrottleManager::from_engine(ThrottleConfig::default(), Arc::new(engine));

        assert!(manager.is_request_allowed(None).is_err());
        assert!(!manager.admit(None));
    }

    #[tokio::test]
    async fn test_sweep_idle_without_ttl_is_noop() {
        let clock = Arc::new(ManualClock::starting_now());
        let manager = manager(ThrottleConfig::default(), clock.clone());
        manager.admit(Some(TOKEN_2_1));
        manager.wait_idle().await;

        clock.advance_secs(3600);
        assert_eq!(manager.sweep_idle(), 0);
    }

    #[tokio::test]
    async fn test_sweep_idle_evicts_tokens() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = ThrottleConfig {
            idle_ttl_secs: Some(60),
            ..ThrottleConfig::default()
        };
        let manager = manager(config, clock.clone());
        manager.admit(Some(TOKEN_2_1));
        manager.wait_idle().await;

        clock.advance_secs(120);
        assert_eq!(manager.sweep_idle(), 1);
        assert_eq!(manager.quota_state(TOKEN_2_1), QuotaState::Unresolved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = ThrottleConfig {
            idle_ttl_secs: Some(60),
            ..ThrottleConfig::default()
        };
        let manager = manager(config, clock.clone());
        manager.admit(Some(TOKEN_2_1));
        manager.wait_idle().await;
        assert_eq!(manager.stats().counters.len(), 3);

        clock.advance_secs(120);
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(manager.stats().counters.len(), 2);
    }
}
