// Admission Decision Benchmarks
//
// Key metrics measured:
// - Guest pool decision latency
// - Resolved token decision latency (aggregate over sibling tokens)
// - Sliding window decision latency
// - Contended decisions from several threads
//
// Usage:
//   cargo bench --bench admission

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rpsguard::throttle::{
    FixedWindowThrottler, ManualClock, Quota, ResolverPool, SlidingWindowThrottler,
    StaticQuotaLookup, Throttler,
};
use std::hint::black_box;
use std::sync::Arc;

const TOKENS: [&str; 4] = ["token-1-1", "token-1-2", "token-2-1", "token-2-2"];

fn lookup() -> StaticQuotaLookup {
    let mut lookup = StaticQuotaLookup::empty();
    lookup.insert(TOKENS[0], Quota::new("User1", 8));
    lookup.insert(TOKENS[1], Quota::new("User1", 8));
    lookup.insert(TOKENS[2], Quota::new("User2", 16));
    lookup.insert(TOKENS[3], Quota::new("User2", 16));
    lookup
}

fn pool() -> ResolverPool {
    ResolverPool::new(2, 8).expect("Failed to start resolver runtime")
}

/// Resolve every stub token up front so decisions take the resolved path
fn primed<T: Throttler>(throttler: T) -> T {
    for token in TOKENS {
        throttler.resolver().resolve(token);
    }
    let resolver = throttler.resolver();
    resolver.pool().handle().block_on(resolver.wait_idle());
    throttler
}

fn fixed() -> FixedWindowThrottler {
    primed(FixedWindowThrottler::new(
        Quota::guest(20),
        Quota::unresolved(20),
        Arc::new(lookup()),
        Arc::new(ManualClock::starting_now()),
        pool(),
    ))
}

fn sliding() -> SlidingWindowThrottler {
    primed(SlidingWindowThrottler::new(
        Quota::guest(20),
        Quota::unresolved(20),
        Arc::new(lookup()),
        Arc::new(ManualClock::starting_now()),
        pool(),
    ))
}

fn bench_single_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_decision");

    let throttler = fixed();
    group.bench_function("fixed_guest", |b| {
        b.iter(|| black_box(throttler.is_request_allowed(black_box(None))))
    });
    group.bench_function("fixed_resolved", |b| {
        b.iter(|| black_box(throttler.is_request_allowed(black_box(Some(TOKENS[0])))))
    });
    group.bench_function("fixed_unresolved", |b| {
        b.iter(|| black_box(throttler.is_request_allowed(black_box(Some("stranger")))))
    });

    let throttler = sliding();
    group.bench_function("sliding_guest", |b| {
        b.iter(|| black_box(throttler.is_request_allowed(black_box(None))))
    });
    group.bench_function("sliding_resolved", |b| {
        b.iter(|| black_box(throttler.is_request_allowed(black_box(Some(TOKENS[2])))))
    });

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_decisions");
    group.sample_size(20);

    for threads in [2usize, 4, 8] {
        let throttler = fixed();
        group.bench_with_input(BenchmarkId::new("fixed", threads), &threads, |b, &threads| {
            b.iter(|| {
                std::thread::scope(|scope| {
                    for t in 0..threads {
                        let throttler = &throttler;
                        scope.spawn(move || {
                            for i in 0..1000 {
                                let token = TOKENS[(t + i) % TOKENS.len()];
                                black_box(throttler.is_request_allowed(Some(token)).ok());
                            }
                        });
                    }
                });
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_decision, bench_contended);
criterion_main!(benches);
