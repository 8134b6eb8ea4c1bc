//! Quota Types and Counter Keys
//!
//! This module provides the value types shared by both throttling
//! algorithms: the resolved quota of a user, the per-token resolution
//! state, and the keys the counter stores are indexed by.

use serde::{Deserialize, Serialize};
use std::fmt;

/// User id carried by the guest pool's quota
pub const GUEST_USER_ID: &str = "guest";

/// User id carried by the unresolved-authenticated pool's quota
pub const UNRESOLVED_USER_ID: &str = "unresolved";

/// Requests-per-second ceiling of a user, shared by all of the user's tokens
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Quota {
    /// Resolved user id
    pub user_id: String,

    /// Maximum admitted requests per second, aggregated over all tokens
    pub max_rps: u32,
}

impl Quota {
    /// Create a new quota
    pub fn new(user_id: impl Into<String>, max_rps: u32) -> Self {
        Self {
            user_id: user_id.into(),
            max_rps,
        }
    }

    /// Quota shared by every request without a token
    pub fn guest(max_rps: u32) -> Self {
        Self::new(GUEST_USER_ID, max_rps)
    }

    /// Quota shared by every token that is not resolved yet
    pub fn unresolved(max_rps: u32) -> Self {
        Self::new(UNRESOLVED_USER_ID, max_rps)
    }

    /// Quota as a signed counter seed
    pub fn limit(&self) -> i64 {
        i64::from(self.max_rps)
    }
}

/// Resolution state of a single token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaState {
    /// Never looked up, or looked up and unknown
    Unresolved,
    /// A lookup is in flight
    Pending,
    /// The quota is cached
    Resolved(Quota),
}

impl QuotaState {
    /// Whether a quota is cached
    pub fn is_resolved(&self) -> bool {
        matches!(self, QuotaState::Resolved(_))
    }
}

/// Shared counters that exist for the whole lifetime of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolKey {
    /// Requests without a token
    GuestPool,
    /// Requests with a token whose quota is not known yet
    UnresolvedAuthenticatedPool,
}

impl PoolKey {
    /// Every pool, in seeding order
    pub const ALL: [PoolKey; 2] = [PoolKey::GuestPool, PoolKey::UnresolvedAuthenticatedPool];

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKey::GuestPool => "guest",
            PoolKey::UnresolvedAuthenticatedPool => "unresolved",
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a counter entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CounterKey {
    /// One of the shared pools
    Pool(PoolKey),
    /// A single token (fixed-second engine)
    Token(String),
    /// A resolved user (sliding window engine)
    User(String),
}

impl CounterKey {
    /// Create a token key
    pub fn token(token: &str) -> Self {
        CounterKey::Token(token.to_string())
    }

    /// Create a user key
    pub fn user(user_id: &str) -> Self {
        CounterKey::User(user_id.to_string())
    }

    /// Whether this key is a pool and must never be evicted
    pub fn is_pool(&self) -> bool {
        matches!(self, CounterKey::Pool(_))
    }
}

impl From<PoolKey> for CounterKey {
    fn from(pool: PoolKey) -> Self {
        CounterKey::Pool(pool)
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterKey::Pool(pool) => write!(f, "pool:{}", pool),
            CounterKey::Token(token) => write!(f, "token:{}", token),
            CounterKey::User(user) => write!(f, "user:{}", user),
        }
    }
}

/// Normalize an inbound token: absent and blank tokens are the same thing
pub fn normalize_token(token: Option<&str>) -> Option<&str> {
    token.filter(|t| !t.trim().is_empty())
}
