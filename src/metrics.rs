// Prometheus metrics for rpsguard
//
// - Admission decisions by path and outcome (counter)
// - Quota lookups by outcome (counter)
// - In-flight quota lookups (gauge)
// - Evicted idle counters (counter)

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("rpsguard_decisions_total", "Admission decisions"),
        &["path", "outcome"]
    ).expect("Failed to create decisions metric");

    pub static ref QUOTA_FETCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("rpsguard_quota_fetches_total", "Settled quota lookups"),
        &["outcome"]
    ).expect("Failed to create quota fetches metric");

    pub static ref PENDING_FETCHES: IntGauge = IntGauge::new(
        "rpsguard_pending_fetches",
        "Quota lookups currently in flight"
    ).expect("Failed to create pending fetches metric");

    pub static ref EVICTED_ENTRIES_TOTAL: IntCounter = IntCounter::new(
        "rpsguard_evicted_entries_total",
        "Idle counters removed by the sweeper"
    ).expect("Failed to create evicted entries metric");
}

/// Initialize metrics registry - call once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUOTA_FETCHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PENDING_FETCHES.clone()))?;
    REGISTRY.register(Box::new(EVICTED_ENTRIES_TOTAL.clone()))?;
    Ok(())
}

/// Record an admission decision
pub fn record_decision(path: &str, admitted: bool) {
    let outcome = if admitted { "admitted" } else { "rejected" };
    DECISIONS_TOTAL.with_label_values(&[path, outcome]).inc();
}

/// Record a settled quota lookup
pub fn record_fetch(outcome: &str) {
    QUOTA_FETCHES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
