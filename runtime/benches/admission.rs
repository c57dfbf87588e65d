//! Admission-path benchmarks
//!
//! Every guarded call pays for these checks before the protected work starts, so they
//! should stay in the sub-microsecond range when uncontended:
//! - Bulkhead slot acquire/release
//! - Circuit breaker admission in the closed state
//! - Rate limiter check against the in-memory window store
//! - Coalescer cache hit
//!
//! Run with: `cargo bench -p pos-resilience-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use pos_resilience_core::CancellationToken;
use pos_resilience_runtime::bulkhead::Bulkhead;
use pos_resilience_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use pos_resilience_runtime::coalescer::RequestCoalescer;
use pos_resilience_runtime::memory_cache::MemoryCache;
use pos_resilience_runtime::memory_store::MemoryWindowStore;
use pos_resilience_runtime::rate_limiter::{RateLimiter, RateLimiterConfig};
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn benchmark_guards(c: &mut Criterion) {
    let mut group = c.benchmark_group("guards");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    group.bench_function("bulkhead_execute", |b| {
        let bulkhead = Bulkhead::new("database", 20);
        let token = CancellationToken::new();

        b.to_async(&runtime).iter(|| async {
            let _ = bulkhead
                .execute(&token, || async { Ok::<_, ()>(black_box(1)) })
                .await;
        });
    });

    group.bench_function("circuit_breaker_closed", |b| {
        let breaker = CircuitBreaker::new("payments", CircuitBreakerConfig::default());

        b.to_async(&runtime).iter(|| async {
            let _ = breaker.call(|| async { Ok::<_, ()>(black_box(1)) }).await;
        });
    });

    group.finish();
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    group.bench_function("memory_check", |b| {
        // Short window keeps the per-key log small
        let limiter = RateLimiter::new(
            "bench",
            MemoryWindowStore::new(),
            RateLimiterConfig::new(1_000, Duration::from_millis(50)),
        );

        b.to_async(&runtime).iter(|| async {
            black_box(limiter.check("10.0.0.1").await);
        });
    });

    group.finish();
}

fn benchmark_coalescer(c: &mut Criterion) {
    let mut group = c.benchmark_group("coalescer");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    group.bench_function("cache_hit", |b| {
        let coalescer: RequestCoalescer<String, String, _> =
            RequestCoalescer::new("menus", MemoryCache::new(1_024))
                .with_default_ttl(Duration::from_secs(3_600));
        runtime
            .block_on(coalescer.get_or_fetch("menu:1", || async { Ok("cached".to_string()) }))
            .expect("warm cache");

        b.to_async(&runtime).iter(|| async {
            let value = coalescer
                .get_or_fetch("menu:1", || async { Ok("refetched".to_string()) })
                .await;
            black_box(value)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_guards,
    benchmark_rate_limiter,
    benchmark_coalescer,
);
criterion_main!(benches);
