//! # Failure Recovery
//!
//! Dead letter reprocessing, circuit breaker recovery, cancellation and
//! timeouts, observed through metrics and the Prometheus exporter.

#[cfg(test)]
mod tests {
    use super::super::support::{counting, test_config};
    use bus_telemetry::{BusMetricsExporter, TelemetryConfig};
    use parking_lot::Mutex;
    use resilient_bus::{
        dead_letter_fn, handler_fn, BoxError, BusError, CircuitBreakerConfig, CircuitState,
        Envelope, ErrorKind, ErrorReporter, EventBus, FailedEvent, SubscriptionOptions,
    };
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tokio_util::sync::CancellationToken;

    /// Poll `check` until it holds or `limit` elapses.
    async fn eventually(limit: Duration, check: impl Fn() -> bool) -> bool {
        timeout(limit, async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    // =============================================================================
    // DEAD LETTER REPROCESSING
    // =============================================================================

    #[tokio::test]
    async fn test_dead_letters_reprocessed_until_accepted() {
        let mut config = test_config();
        config.dlq_interval = Duration::from_millis(20);
        let bus = EventBus::<Envelope>::new(config);
        bus.subscribe("payment.captured", counting(Arc::new(AtomicU32::new(0)), true))
            .expect("subscribe");

        // Rejects the first attempt, accepts the second.
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        bus.add_dead_letter_handler(Arc::new(dead_letter_fn(
            "replay",
            move |failed: FailedEvent<Envelope>| {
                let seen = Arc::clone(&seen);
                async move {
                    assert_eq!(failed.event.event_type, "payment.captured");
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(BoxError::from("ledger offline"))
                    } else {
                        Ok(())
                    }
                }
            },
        )));

        let ctx = CancellationToken::new();
        bus.start(&ctx).await.expect("start");
        assert!(bus
            .publish(&ctx, Envelope::new("payment.captured"))
            .await
            .is_err());
        assert_eq!(bus.dead_letters().len(), 1);

        assert!(eventually(Duration::from_secs(2), || bus.dead_letters().is_empty()).await);
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        bus.stop(&ctx).await.expect("stop");
    }

    #[tokio::test]
    async fn test_dead_letter_queue_is_bounded() {
        let mut config = test_config();
        config.dlq_size = 2;
        let bus = EventBus::<Envelope>::new(config);
        bus.subscribe("*", counting(Arc::new(AtomicU32::new(0)), true))
            .expect("subscribe");

        let ctx = CancellationToken::new();
        for event_type in ["a", "b", "c"] {
            assert!(bus.publish(&ctx, Envelope::new(event_type)).await.is_err());
        }

        let kept: Vec<String> = bus
            .dead_letters()
            .entries()
            .into_iter()
            .map(|f| f.event.event_type)
            .collect();
        assert_eq!(kept, vec!["b", "c"]);
        assert_eq!(bus.metrics().dead_lettered, 3);
    }

    // =============================================================================
    // CIRCUIT BREAKER RECOVERY
    // =============================================================================

    #[tokio::test]
    async fn test_circuit_recovers_after_timeout() {
        let mut config = test_config();
        config.circuit_breaker = CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 2,
            timeout: Duration::from_millis(50),
        };
        let bus = EventBus::<Envelope>::new(config);

        let healthy = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&healthy);
        bus.subscribe(
            "inventory.reserved",
            Arc::new(handler_fn("inventory", move |_e: Envelope| {
                let flag = Arc::clone(&flag);
                async move {
                    if flag.load(Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err(BoxError::from("warehouse down"))
                    }
                }
            })),
        )
        .expect("subscribe");

        let ctx = CancellationToken::new();
        for _ in 0..2 {
            assert!(bus.publish(&ctx, Envelope::new("inventory.reserved")).await.is_err());
        }
        assert_eq!(bus.circuit_state(), CircuitState::Open);
        assert_eq!(
            bus.publish(&ctx, Envelope::new("inventory.reserved"))
                .await
                .map_err(|e| e.kind()),
            Err(ErrorKind::CircuitOpen)
        );

        healthy.store(true, Ordering::SeqCst);
        sleep(Duration::from_millis(80)).await;

        bus.publish(&ctx, Envelope::new("inventory.reserved"))
            .await
            .expect("trial publish succeeds");
        assert_eq!(bus.circuit_state(), CircuitState::Closed);
        assert_eq!(bus.circuit_stats().failure_count, 0);
    }

    // =============================================================================
    // CANCELLATION + TIMEOUTS
    // =============================================================================

    fn sleeper(duration: Duration) -> Arc<dyn resilient_bus::EventHandler<Envelope>> {
        Arc::new(handler_fn("sleeper", move |_e: Envelope| async move {
            sleep(duration).await;
            Ok::<(), BoxError>(())
        }))
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_slow_handler() {
        let bus = EventBus::<Envelope>::new(test_config());
        bus.subscribe("export.requested", sleeper(Duration::from_secs(30)))
            .expect("subscribe");

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = timeout(
            Duration::from_secs(2),
            bus.publish(&ctx, Envelope::new("export.requested")),
        )
        .await
        .expect("publish returns promptly");
        assert_eq!(result, Err(BusError::Cancelled));
        // Cancellation is not a delivery failure worth replaying.
        assert!(bus.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_handler_timeout_is_retried_then_dead_lettered() {
        let bus = EventBus::<Envelope>::new(test_config());
        bus.subscribe_with_options(
            "export.requested",
            sleeper(Duration::from_secs(30)),
            SubscriptionOptions::new()
                .timeout(Duration::from_millis(20))
                .max_retries(1),
        )
        .expect("subscribe");

        let err = bus
            .publish(&CancellationToken::new(), Envelope::new("export.requested"))
            .await
            .expect_err("handler times out");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(bus.metrics().retries, 1);

        let dead = bus.dead_letters().entries();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
    }

    // =============================================================================
    // ERROR REPORTING + TELEMETRY
    // =============================================================================

    #[derive(Default)]
    struct Collector {
        reports: Mutex<Vec<(String, String, ErrorKind)>>,
    }

    impl ErrorReporter for Collector {
        fn report(&self, source: &str, event_type: &str, error: &BusError) {
            self.reports
                .lock()
                .push((source.to_string(), event_type.to_string(), error.kind()));
        }
    }

    #[tokio::test]
    async fn test_async_failures_reach_injected_reporter() {
        let reporter = Arc::new(Collector::default());
        let bus = EventBus::<Envelope>::new(test_config()).with_error_reporter(reporter.clone());
        bus.subscribe_with_options(
            "email.send",
            counting(Arc::new(AtomicU32::new(0)), true),
            SubscriptionOptions::new().asynchronous(),
        )
        .expect("subscribe");

        let ctx = CancellationToken::new();
        bus.start(&ctx).await.expect("start");
        bus.publish(&ctx, Envelope::new("email.send"))
            .await
            .expect("publisher unaffected");
        bus.stop(&ctx).await.expect("stop");

        let reports = reporter.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1, "email.send");
        assert_eq!(reports[0].2, ErrorKind::Handler);
    }

    #[tokio::test]
    async fn test_exporter_reflects_failures() {
        let bus = EventBus::<Envelope>::new(test_config());
        bus.subscribe(
            "message",
            counting(Arc::new(AtomicU32::new(0)), true),
        )
        .expect("subscribe");

        let ctx = CancellationToken::new();
        for _ in 0..2 {
            assert!(bus.publish(&ctx, Envelope::new("message")).await.is_err());
        }

        let config = TelemetryConfig::default();
        let exporter = BusMetricsExporter::new(&config.metrics_namespace).expect("exporter");
        exporter.observe(&bus.metrics());
        exporter.observe_circuit(bus.circuit_state());

        let text = exporter.encode().expect("encode");
        assert!(text.contains("rb_events_published_total 2"));
        assert!(text.contains("rb_events_failed_total 2"));
        assert!(text.contains("rb_dead_lettered_total 2"));
        assert!(text.contains("rb_circuit_state 0"));
    }
}
