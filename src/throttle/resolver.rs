//! Single-Flight Quota Resolver
//!
//! Resolves token quotas in the background without ever blocking an
//! admission decision.
//!
//! # Flow
//!
//! ```text
//! resolve(token) ──► pending table ──(vacant)──► fetch task on ResolverPool
//!                        ▲                              │
//!                        │                              ▼
//!                   remove marker ◄── merge worker ◄── mpsc<Merge>
//!                                         │
//!                                         ▼
//!                                    QuotaSink::merge_quota
//! ```
//!
//! At most one fetch is in flight per token. The marker is removed only
//! after the outcome has been merged, whatever the outcome was.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

use super::cache::QuotaSink;
use super::clock::Clock;
use super::lookup::QuotaLookup;
use super::quota::{Quota, QuotaState};
use crate::metrics;

/// Outcome of a single quota lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Backend returned a quota
    Resolved(Quota),
    /// Backend has no record for the token
    Unknown,
    /// Backend call failed or panicked
    Failed(String),
}

impl FetchOutcome {
    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Resolved(_) => "resolved",
            FetchOutcome::Unknown => "unknown",
            FetchOutcome::Failed(_) => "failed",
        }
    }
}

/// Marker of an in-flight lookup
#[derive(Debug, Clone)]
pub struct PendingFetch {
    /// When the lookup was issued
    pub started_at: DateTime<Utc>,

    settled: watch::Receiver<bool>,
}

/// Runtime that is shut down in the background when dropped, so a pool can
/// be released from inside another runtime
#[derive(Debug)]
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Bounded worker pool for quota lookups
///
/// Lookups are spawned on `handle` and at most `max_in_flight` of them call
/// the backend at once; the rest wait for a permit.
#[derive(Debug, Clone)]
pub struct ResolverPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    worker_threads: Option<usize>,
    _runtime: Option<Arc<OwnedRuntime>>,
}

impl ResolverPool {
    /// Build a dedicated multi-threaded runtime for lookups
    pub fn new(worker_threads: usize, max_in_flight: usize) -> std::io::Result<Self> {
        let worker_threads = worker_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("quota-resolver")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            worker_threads: Some(worker_threads),
            _runtime: Some(Arc::new(OwnedRuntime(Some(runtime)))),
            ..Self::from_handle(handle, max_in_flight)
        })
    }

    /// Run lookups on an existing runtime
    pub fn from_handle(handle: Handle, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            worker_threads: None,
            _runtime: None,
        }
    }

    /// Runtime handle lookups run on
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Maximum number of concurrent backend calls
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Worker threads of the dedicated runtime, `None` when borrowing one
    pub fn worker_threads(&self) -> Option<usize> {
        self.worker_threads
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }
}

/// Instruction sent from a finished fetch to the merge worker
struct Merge {
    token: String,
    outcome: FetchOutcome,
    settled: watch::Sender<bool>,
}

struct Shared {
    pending: DashMap<String, PendingFetch>,
    sink: Arc<dyn QuotaSink>,
    lookup: Arc<dyn QuotaLookup>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    /// Merge an outcome into the sink, then drop the pending marker
    fn settle(&self, merge: Merge) {
        let Merge {
            token,
            outcome,
            settled,
        } = merge;

        match &outcome {
            FetchOutcome::Resolved(quota) => {
                debug!(
                    user_id = %quota.user_id,
                    max_rps = quota.max_rps,
                    "Quota resolved"
                );
                self.sink
                    .merge_quota(&token, quota.clone(), self.clock.epoch_second());
            }
            FetchOutcome::Unknown => {
                debug!("Quota backend has no record for token");
            }
            FetchOutcome::Failed(reason) => {
                warn!(reason = %reason, "Quota lookup failed, token stays unresolved");
            }
        }

        if self.pending.remove(&token).is_some() {
            metrics::PENDING_FETCHES.dec();
        }
        metrics::record_fetch(outcome.label());
        settled.send_replace(true);
    }
}

/// Deduplicating, fire-and-forget quota resolver
pub struct QuotaResolver {
    shared: Arc<Shared>,
    pool: ResolverPool,
    merges: mpsc::UnboundedSender<Merge>,
}

impl std::fmt::Debug for QuotaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaResolver")
            .field("pending", &self.shared.pending.len())
            .field("pool", &self.pool)
            .finish()
    }
}

impl QuotaResolver {
    /// Create a resolver and start its merge worker on `pool`
    pub fn new(
        sink: Arc<dyn QuotaSink>,
        lookup: Arc<dyn QuotaLookup>,
        clock: Arc<dyn Clock>,
        pool: ResolverPool,
    ) -> Self {
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            sink,
            lookup,
            clock,
        });
        let (merges, mut rx) = mpsc::unbounded_channel::<Merge>();

        let worker = shared.clone();
        pool.spawn(async move {
            while let Some(merge) = rx.recv().await {
                worker.settle(merge);
            }
            debug!("Quota merge worker stopped");
        });

        Self {
            shared,
            pool,
            merges,
        }
    }

    /// Start resolving a token unless it is cached or already in flight.
    /// Never waits for the backend.
    pub fn resolve(&self, token: &str) {
        if self.shared.sink.cached_quota(token).is_some() {
            return;
        }

        match self.shared.pending.entry(token.to_string()) {
            Entry::Occupied(_) => {
                debug!("Quota lookup already in flight");
            }
            Entry::Vacant(slot) => {
                // A fetch may have settled between the cache check and the
                // entry lock; its merge happens before its marker is removed
                if self.shared.sink.cached_quota(token).is_some() {
                    return;
                }
                let (settled_tx, settled_rx) = watch::channel(false);
                slot.insert(PendingFetch {
                    started_at: self.shared.clock.now(),
                    settled: settled_rx,
                });
                metrics::PENDING_FETCHES.inc();
                self.spawn_fetch(token.to_string(), settled_tx);
            }
        }
    }

    fn spawn_fetch(&self, token: String, settled: watch::Sender<bool>) {
        let shared = self.shared.clone();
        let permits = self.pool.permits.clone();
        let merges = self.merges.clone();

        self.pool.spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => fetch(shared.lookup.as_ref(), &token).await,
                Err(_) => FetchOutcome::Failed("resolver pool closed".to_string()),
            };

            let merge = Merge {
                token,
                outcome,
                settled,
            };
            if let Err(mpsc::error::SendError(merge)) = merges.send(merge) {
                shared.settle(merge);
            }
        });
    }

    /// Resolution state of a token
    pub fn state(&self, token: &str) -> QuotaState {
        if let Some(quota) = self.shared.sink.cached_quota(token) {
            QuotaState::Resolved(quota)
        } else if self.shared.pending.contains_key(token) {
            QuotaState::Pending
        } else {
            QuotaState::Unresolved
        }
    }

    /// Marker of the token's in-flight lookup, if any
    pub fn pending(&self, token: &str) -> Option<PendingFetch> {
        self.shared.pending.get(token).map(|p| p.value().clone())
    }

    /// Number of in-flight lookups
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Tokens with an in-flight lookup
    pub fn pending_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .shared
            .pending
            .iter()
            .map(|p| p.key().clone())
            .collect();
        tokens.sort();
        tokens
    }

    /// Wait until the token's in-flight lookup (if any) has been merged
    pub async fn wait_settled(&self, token: &str) {
        let settled = self.shared.pending.get(token).map(|p| p.settled.clone());
        if let Some(mut settled) = settled {
            let _ = settled.wait_for(|done| *done).await;
        }
    }

    /// Wait until every lookup in flight at call time has been merged
    pub async fn wait_idle(&self) {
        let receivers: Vec<watch::Receiver<bool>> = self
            .shared
            .pending
            .iter()
            .map(|p| p.settled.clone())
            .collect();
        for mut settled in receivers {
            let _ = settled.wait_for(|done| *done).await;
        }
    }

    /// Pool the resolver runs on
    pub fn pool(&self) -> &ResolverPool {
        &self.pool
    }
}

async fn fetch(lookup: &dyn QuotaLookup, token: &str) -> FetchOutcome {
    match AssertUnwindSafe(lookup.fetch_quota(token))
        .catch_unwind()
        .await
    {
        Ok(Ok(Some(quota))) => FetchOutcome::Resolved(quota),
        Ok(Ok(None)) => FetchOutcome::Unknown,
        Ok(Err(err)) => FetchOutcome::Failed(err.to_string()),
        Err(_) => FetchOutcome::Failed("quota lookup panicked".to_string()),
    }
}
