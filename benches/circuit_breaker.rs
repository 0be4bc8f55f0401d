use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use workflow_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

fn circuit_breaker_throughput_success(c: &mut Criterion) {
    let cb = CircuitBreaker::with_config(CircuitBreakerConfig {
        failure_threshold: 10,
        cooldown: Duration::from_secs(30),
        half_open_max_calls: 1,
    });

    c.bench_function("circuit_breaker_success_100k_rps", |b| {
        b.iter(|| {
            let adm = black_box(&cb).admit().unwrap();
            cb.record_success(adm);
        });
    });
}

fn circuit_breaker_throughput_failure(c: &mut Criterion) {
    // Never opens, so every call keeps exercising the admit/record_failure path.
    let cb = CircuitBreaker::with_config(CircuitBreakerConfig::disabled());

    c.bench_function("circuit_breaker_failure_100k_rps", |b| {
        b.iter(|| {
            let adm = black_box(&cb).admit().unwrap();
            cb.record_failure(adm);
        });
    });
}

criterion_group!(benches, circuit_breaker_throughput_success, circuit_breaker_throughput_failure);
criterion_main!(benches);
