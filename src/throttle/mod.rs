//! Per-User Request Throttling
//!
//! Decides, for each incoming request, whether it may proceed given a
//! per-user requests-per-second quota that lives in a slow external backend.
//!
//! # Features
//!
//! - Fixed-second and sliding-window admission engines
//! - Guest and unresolved-token pools with configured quotas
//! - Aggregate ceiling per user across all of the user's tokens
//! - Single-flight background quota resolution that never blocks a decision
//! - Idle counter eviction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Throttle Manager                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐    ┌──────────────────────┐       │
//! │  │ FixedWindowThrottler │ or │ SlidingWindowThrottler│      │
//! │  │ CounterStore         │    │ WindowStore           │      │
//! │  │ UserIndex            │    │ QuotaCache            │      │
//! │  └──────────┬───────────┘    └──────────┬───────────┘       │
//! ├─────────────┴────────────────────────────┴──────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │   QuotaResolver (single-flight) ──► QuotaLookup      │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fixed;
pub mod lookup;
pub mod manager;
pub mod quota;
pub mod resolver;
pub mod sliding;
pub mod stats;
pub mod store;
pub mod users;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{QuotaCache, QuotaSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Algorithm, ThrottleConfig};
pub use error::{LookupError, ThrottleError};
pub use fixed::FixedWindowThrottler;
pub use lookup::{LookupLatency, QuotaLookup, StaticQuotaLookup};
pub use manager::ThrottleManager;
pub use quota::{CounterKey, PoolKey, Quota, QuotaState};
pub use resolver::{QuotaResolver, ResolverPool};
pub use sliding::SlidingWindowThrottler;
pub use stats::ThrottleStats;

/// Admission engine
pub trait Throttler: Send + Sync + std::fmt::Debug {
    /// Decide one request. `None` or a blank token is a guest.
    ///
    /// Never waits for the quota backend.
    fn is_request_allowed(&self, token: Option<&str>) -> Result<bool, ThrottleError>;

    /// Resolution state of a token
    fn quota_state(&self, token: &str) -> QuotaState;

    /// Background resolver
    fn resolver(&self) -> &QuotaResolver;

    /// Drop non-pool state untouched for longer than `idle`. Returns the
    /// number of removed entries.
    fn evict_idle(&self, idle: Duration) -> usize;

    /// Snapshot for introspection
    fn stats(&self) -> ThrottleStats;
}
