//! Shared fixtures for engine tests

use std::sync::atomic::{AtomicUsize, Ordering};

use super::lookup::{LookupLatency, StaticQuotaLookup};
use super::quota::Quota;
use super::Throttler;

pub const TOKEN_1_1: &str = "token-1-1";
pub const TOKEN_1_2: &str = "token-1-2";
pub const TOKEN_2_1: &str = "token-2-1";
pub const TOKEN_2_2: &str = "token-2-2";

const THREADS: usize = 8;

/// Backend with two users: `User1` at 8 rps and `User2` at 16 rps, two
/// tokens each
pub fn stub_lookup(latency: LookupLatency) -> StaticQuotaLookup {
    let mut lookup = StaticQuotaLookup::empty().with_latency(latency);
    lookup.insert(TOKEN_1_1, Quota::new("User1", 8));
    lookup.insert(TOKEN_1_2, Quota::new("User1", 8));
    lookup.insert(TOKEN_2_1, Quota::new("User2", 16));
    lookup.insert(TOKEN_2_2, Quota::new("User2", 16));
    lookup
}

/// Issue `requests` decisions from several threads and return
/// `(admitted, rejected)`. `token` maps a request index to its token.
pub fn fire<T, F>(throttler: &T, requests: usize, token: F) -> (usize, usize)
where
    T: Throttler + ?Sized,
    F: Fn(usize) -> Option<String> + Sync,
{
    let admitted = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let admitted = &admitted;
            let token = &token;
            scope.spawn(move || {
                for i in (t..requests).step_by(THREADS) {
                    if throttler.is_request_allowed(token(i).as_deref()).unwrap() {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    let admitted = admitted.into_inner();
    (admitted, requests - admitted)
}
