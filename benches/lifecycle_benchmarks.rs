// Copyright 2025 Cowboy AI, LLC.

use async_trait::async_trait;
use cim_lifecycle::{
    BackoffPolicy, EventBus, EventEnvelope, EventHandler, EventStore, EventType,
    HealthCheckCompleted, InMemoryKeyValueStore, KvEventStore, LifecycleEvent, LifecycleResult,
    ServiceIdentity,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

struct Counting(AtomicU64);

#[async_trait]
impl EventHandler for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    async fn handle(&self, _envelope: &EventEnvelope) -> LifecycleResult<()> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn setup_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn probe_event() -> LifecycleEvent {
    LifecycleEvent::HealthCheckCompleted(HealthCheckCompleted {
        identity: ServiceIdentity::new("default", "weather").unwrap(),
        success: true,
        response_time_ms: Some(3),
        error: None,
        manual: false,
    })
}

fn benchmark_bus_dispatch(c: &mut Criterion) {
    let rt = setup_runtime();
    let mut group = c.benchmark_group("bus_dispatch");

    for handlers in [1usize, 5, 20] {
        let bus = rt.block_on(async {
            let bus = EventBus::new();
            for priority in 0..handlers {
                bus.subscribe(
                    EventType::HealthCheckCompleted,
                    Arc::new(Counting(AtomicU64::new(0))),
                    priority as i32,
                )
                .await;
            }
            bus
        });

        group.bench_with_input(BenchmarkId::new("inline", handlers), &handlers, |b, _| {
            b.to_async(&rt).iter(|| async {
                bus.emit(black_box(probe_event()), "bench", true).await.unwrap();
            });
        });
    }
    group.finish();
}

fn benchmark_event_log_append(c: &mut Criterion) {
    let rt = setup_runtime();
    let store = KvEventStore::new(Arc::new(InMemoryKeyValueStore::new()));
    let payload = probe_event().payload().unwrap();

    c.bench_function("event_log_append", |b| {
        b.to_async(&rt).iter(|| async {
            store
                .append_event("health_check_completed", black_box(payload.clone()), "bench", None)
                .await
                .unwrap();
        });
    });
}

fn benchmark_backoff(c: &mut Criterion) {
    let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
    c.bench_function("backoff_delay", |b| {
        b.iter(|| {
            for retry in 0..32 {
                black_box(policy.delay(black_box(retry)));
            }
        });
    });
}

criterion_group!(
    benches,
    benchmark_bus_dispatch,
    benchmark_event_log_append,
    benchmark_backoff
);
criterion_main!(benches);
