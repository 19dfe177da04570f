//! # Resilient Bus Publish Benchmarks
//!
//! | Benchmark | Measures |
//! |-----------|----------|
//! | `publish_sync` | Publish with N synchronous subscribers |
//! | `publish_pipeline` | Publish through validator, transformer and filter |
//! | `publish_routed` | Publish fanned out to several destinations |
//! | `publish_async` | Publish with asynchronous subscribers (spawn cost only) |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resilient_bus::{
    filter_fn, handler_fn, transform_fn, validate_fn, BoxError, Envelope, EventBus,
    EventBusConfig, EventHandler, Route, SubscriptionOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn bench_config() -> EventBusConfig {
    EventBusConfig {
        history_size: 10_000,
        dlq_enabled: false,
        ..EventBusConfig::default()
    }
}

fn noop() -> Arc<dyn EventHandler<Envelope>> {
    Arc::new(handler_fn("noop", |event: Envelope| async move {
        black_box(event);
        Ok::<(), BoxError>(())
    }))
}

fn bench_publish_sync(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("publish_sync");
    group.measurement_time(Duration::from_secs(5));

    for subscribers in [1usize, 10, 100] {
        let bus = EventBus::<Envelope>::new(bench_config());
        for priority in 0..subscribers {
            bus.subscribe_with_options(
                "bench.event",
                noop(),
                SubscriptionOptions::new().priority(priority as i32),
            )
            .expect("subscribe");
        }
        let ctx = CancellationToken::new();

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    bus.publish(&ctx, Envelope::text("bench.event", "payload"))
                        .await
                        .expect("publish");
                })
            },
        );
    }

    group.finish();
}

fn bench_publish_pipeline(c: &mut Criterion) {
    let rt = runtime();
    let bus = EventBus::<Envelope>::new(bench_config());
    bus.add_validator(Arc::new(validate_fn("non-empty", |e: &Envelope| {
        if e.payload.is_empty() {
            Err(BoxError::from("empty"))
        } else {
            Ok(())
        }
    })));
    bus.add_transformer(Arc::new(transform_fn("stamp", |e: Envelope| {
        Ok(e.with_metadata("stamped", "true"))
    })));
    bus.add_filter(Arc::new(filter_fn("all", |_e: &Envelope| true)));
    bus.subscribe("bench.event", noop()).expect("subscribe");
    let ctx = CancellationToken::new();

    c.bench_function("publish_pipeline", |b| {
        b.to_async(&rt).iter(|| async {
            bus.publish(&ctx, Envelope::text("bench.event", "payload"))
                .await
                .expect("publish");
        })
    });
}

fn bench_publish_routed(c: &mut Criterion) {
    let rt = runtime();
    let bus = EventBus::<Envelope>::new(bench_config());
    for destination in ["billing", "shipping", "audit", "analytics"] {
        bus.add_route(Route::new("order.*", destination));
        bus.subscribe(destination, noop()).expect("subscribe");
    }
    let ctx = CancellationToken::new();

    c.bench_function("publish_routed", |b| {
        b.to_async(&rt).iter(|| async {
            bus.publish(&ctx, Envelope::text("order.placed", "payload"))
                .await
                .expect("publish");
        })
    });
}

fn bench_publish_async(c: &mut Criterion) {
    let rt = runtime();
    let bus = EventBus::<Envelope>::new(bench_config());
    for _ in 0..10 {
        bus.subscribe_with_options(
            "bench.event",
            noop(),
            SubscriptionOptions::new().asynchronous(),
        )
        .expect("subscribe");
    }
    let ctx = CancellationToken::new();
    rt.block_on(bus.start(&ctx)).expect("start");

    c.bench_function("publish_async", |b| {
        b.to_async(&rt).iter(|| async {
            bus.publish(&ctx, Envelope::text("bench.event", "payload"))
                .await
                .expect("publish");
        })
    });

    rt.block_on(bus.stop(&ctx)).expect("stop");
}

criterion_group!(
    benches,
    bench_publish_sync,
    bench_publish_pipeline,
    bench_publish_routed,
    bench_publish_async
);
criterion_main!(benches);
