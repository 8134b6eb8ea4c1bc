//! rpsguard Library
//!
//! Per-user requests-per-second admission control. Quotas are resolved
//! lazily from a slow backend without ever blocking a decision.

pub mod config;
pub mod metrics;
pub mod throttle;
