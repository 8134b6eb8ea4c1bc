//! Throttle Error Types
//!
//! This module defines the errors surfaced by the admission engines and by
//! the quota lookup collaborator.

use super::quota::{PoolKey, Quota};

/// Errors that abort an admission decision
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// A pool counter is missing from the store
    #[error("Pool counter {0} is missing from the store")]
    MissingPool(PoolKey),

    /// Two tokens of the same user carry different quotas in the same second
    #[error("Conflicting quotas for user {user_id}: {first:?} vs {second:?}")]
    ConflictingQuotas {
        user_id: String,
        first: Quota,
        second: Quota,
    },
}

/// Errors returned by a quota lookup backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum LookupError {
    /// Backend returned an error
    #[error("Quota backend error: {0}")]
    Backend(String),

    /// Backend could not be reached
    #[error("Quota backend unavailable")]
    Unavailable,
}
