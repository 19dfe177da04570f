//! # Reference Scenarios
//!
//! 1. **Priority ordering**: synchronous subscribers run highest priority first
//! 2. **Circuit breaking**: consecutive failures trip the breaker and later
//!    publishes fail fast without reaching any handler
//! 3. **Retry budget**: a failing subscriber runs once plus its retries, then
//!    lands in the dead letter queue

#[cfg(test)]
mod tests {
    use super::super::support::{counting, recording, test_config};
    use parking_lot::Mutex;
    use resilient_bus::{
        BusError, CircuitBreakerConfig, CircuitState, Envelope, ErrorKind, EventBus,
        SubscriptionOptions,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    // =============================================================================
    // SCENARIO A: PRIORITY ORDER
    // =============================================================================

    #[tokio::test]
    async fn test_sync_subscribers_run_by_priority() -> anyhow::Result<()> {
        let bus = EventBus::<Envelope>::new(test_config());
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_with_options(
            "message",
            recording(Arc::clone(&log), 5),
            SubscriptionOptions::new().priority(5),
        )?;
        bus.subscribe_with_options(
            "message",
            recording(Arc::clone(&log), 10),
            SubscriptionOptions::new().priority(10),
        )?;

        let ctx = CancellationToken::new();
        bus.start(&ctx).await?;
        bus.publish(&ctx, Envelope::text("message", "hello")).await?;
        bus.stop(&ctx).await?;

        assert_eq!(*log.lock(), vec![10, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() -> anyhow::Result<()> {
        let bus = EventBus::<Envelope>::new(test_config());
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            bus.subscribe("message", recording(Arc::clone(&log), tag))?;
        }
        bus.subscribe_with_options(
            "message",
            recording(Arc::clone(&log), "urgent"),
            SubscriptionOptions::new().priority(1),
        )?;

        bus.publish(&CancellationToken::new(), Envelope::new("message"))
            .await?;
        assert_eq!(*log.lock(), vec!["urgent", "first", "second", "third"]);
        Ok(())
    }

    // =============================================================================
    // SCENARIO B: CIRCUIT BREAKER
    // =============================================================================

    #[tokio::test]
    async fn test_fourth_publish_fails_fast_when_circuit_open() {
        let mut config = test_config();
        config.circuit_breaker = CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 3,
            timeout: Duration::from_secs(60),
        };
        let bus = EventBus::<Envelope>::new(config);
        let calls = Arc::new(AtomicU32::new(0));
        bus.subscribe("message", counting(Arc::clone(&calls), true))
            .expect("subscribe");

        let ctx = CancellationToken::new();
        for attempt in 1..=3 {
            let err = bus
                .publish(&ctx, Envelope::new("message"))
                .await
                .expect_err("handler always fails");
            assert_eq!(err.kind(), ErrorKind::Handler, "attempt {attempt}");
        }
        assert_eq!(bus.circuit_state(), CircuitState::Open);

        let err = bus
            .publish(&ctx, Envelope::new("message"))
            .await
            .expect_err("circuit is open");
        assert!(matches!(err, BusError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(bus.metrics().rejected, 1);
    }

    // =============================================================================
    // SCENARIO C: RETRY BUDGET
    // =============================================================================

    #[tokio::test]
    async fn test_retry_budget_then_dead_letter() {
        let bus = EventBus::<Envelope>::new(test_config());
        let calls = Arc::new(AtomicU32::new(0));
        let id = bus
            .subscribe_with_options(
                "message",
                counting(Arc::clone(&calls), true),
                SubscriptionOptions::new().max_retries(2),
            )
            .expect("subscribe");

        let err = bus
            .publish(&CancellationToken::new(), Envelope::text("message", "payload"))
            .await
            .expect_err("retries exhausted");
        assert_eq!(err.kind(), ErrorKind::Handler);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let dead = bus.dead_letters().entries();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].event.payload.as_text(), Some("payload"));
        match &dead[0].error {
            BusError::DeadLetterExhausted {
                subscription_id,
                attempts,
                ..
            } => {
                assert_eq!(*subscription_id, id);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected dead letter error: {other}"),
        }

        let metrics = bus.metrics();
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_disabled_still_counts_failure() {
        let mut config = test_config();
        config.dlq_enabled = false;
        let bus = EventBus::<Envelope>::new(config);
        bus.subscribe("message", counting(Arc::new(AtomicU32::new(0)), true))
            .expect("subscribe");

        assert!(bus
            .publish(&CancellationToken::new(), Envelope::new("message"))
            .await
            .is_err());
        assert!(bus.dead_letters().is_empty());
        assert_eq!(bus.metrics().failed, 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_handler_no_longer_runs() {
        let bus = EventBus::<Envelope>::new(test_config());
        let calls = Arc::new(AtomicU32::new(0));
        let id = bus
            .subscribe("message", counting(Arc::clone(&calls), false))
            .expect("subscribe");

        let ctx = CancellationToken::new();
        bus.publish(&ctx, Envelope::new("message")).await.expect("first");
        bus.unsubscribe(id).expect("unsubscribe");
        bus.publish(&ctx, Envelope::new("message")).await.expect("second");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.unsubscribe(id), Err(BusError::SubscriptionNotFound(id)));
        assert_eq!(bus.subscription_count(), 0);
    }
}
