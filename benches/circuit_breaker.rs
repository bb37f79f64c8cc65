use criterion::{criterion_group, criterion_main, Criterion};
use resilience::{CircuitBreaker, CircuitBreakerConfig, ExponentialSchedule};
use std::time::Duration;
use tokio::runtime::Runtime;

fn closed_call_overhead(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let breaker = rt.block_on(async {
        let config = CircuitBreakerConfig::new(1_000_000, ExponentialSchedule::new(Duration::from_secs(1), 2.0));
        CircuitBreaker::new(config, resilience::clock::tokio_clock(), |_| {}).expect("valid config")
    });

    c.bench_function("circuit_breaker_closed_call", |b| {
        b.to_async(&rt).iter(|| async {
            breaker
                .call(|| async { Ok::<_, &'static str>(()) })
                .await
                .unwrap();
        });
    });
}

criterion_group!(benches, closed_call_overhead);
criterion_main!(benches);
