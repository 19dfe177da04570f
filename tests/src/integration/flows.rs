//! # End-to-End Flows
//!
//! An order-processing flow exercising every stage an event passes through:
//!
//! ```text
//! publish ─► validate ─► transform ─► filter ─► route ─► middleware ─► handler
//!                                                  └──► bridge / batch sink
//! ```

#[cfg(test)]
mod tests {
    use super::super::support::{counting, recording, test_config};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use resilient_bus::{
        filter_fn, handler_fn, transform_fn, validate_fn, BatchSink, BatcherConfig, BoxError,
        BroadcastBridge, Envelope, ErrorKind, EventBatch, EventBus, EventHandler,
        EventMiddleware, Next, Route, SubscriptionOptions,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn collector(seen: Arc<Mutex<Vec<Envelope>>>) -> Arc<dyn EventHandler<Envelope>> {
        Arc::new(handler_fn("collector", move |e: Envelope| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(e);
                Ok::<(), BoxError>(())
            }
        }))
    }

    fn amount(event: &Envelope) -> Option<u64> {
        event.payload.as_json()?.get("amount")?.as_u64()
    }

    // =============================================================================
    // PIPELINE + ROUTING
    // =============================================================================

    #[tokio::test]
    async fn test_order_flow_through_pipeline_and_routes() -> anyhow::Result<()> {
        let bus = EventBus::<Envelope>::new(test_config());

        bus.add_validator(Arc::new(validate_fn("has-amount", |e: &Envelope| {
            match amount(e) {
                Some(_) => Ok(()),
                None => Err(BoxError::from("order without amount")),
            }
        })));
        bus.add_transformer(Arc::new(transform_fn("stamp", |e: Envelope| {
            Ok(e.with_metadata("normalized", "true"))
        })));
        bus.add_filter(Arc::new(filter_fn("skip-free", |e: &Envelope| {
            amount(e) != Some(0)
        })));

        bus.add_route(
            Route::new("order.*", "billing")
                .priority(10)
                .transform(|e: Envelope| e.with_metadata("route", "billing")),
        );
        bus.add_route(
            Route::new("order.*", "audit")
                .filter(Arc::new(filter_fn("large", |e: &Envelope| {
                    amount(e).unwrap_or_default() > 100
                })))
                .transform(|e: Envelope| e.with_metadata("route", "audit")),
        );

        let billing = Arc::new(Mutex::new(Vec::new()));
        let audit = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("billing", collector(Arc::clone(&billing)))?;
        bus.subscribe("audit", collector(Arc::clone(&audit)))?;

        let ctx = CancellationToken::new();
        bus.start(&ctx).await?;

        let rejected = bus
            .publish(&ctx, Envelope::text("order.placed", "not json"))
            .await
            .expect_err("validator rejects");
        assert_eq!(rejected.kind(), ErrorKind::Validation);

        bus.publish(&ctx, Envelope::json("order.placed", json!({ "amount": 0 })))
            .await?;
        bus.publish(&ctx, Envelope::json("order.placed", json!({ "amount": 40 })))
            .await?;

        let mut metadata = BTreeMap::new();
        metadata.insert("tenant".to_string(), "acme".to_string());
        bus.publish_with_metadata(
            &ctx,
            Envelope::json("order.placed", json!({ "amount": 500 })),
            metadata,
        )
        .await?;
        bus.stop(&ctx).await?;

        let billing = billing.lock();
        assert_eq!(billing.len(), 2);
        assert!(billing
            .iter()
            .all(|e| e.metadata.get("route").map(String::as_str) == Some("billing")
                && e.metadata.contains_key("normalized")));

        let audit = audit.lock();
        assert_eq!(audit.len(), 1);
        assert_eq!(amount(&audit[0]), Some(500));

        let history = bus.history().by_type("order.placed");
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[1].metadata.get("tenant").map(String::as_str),
            Some("acme")
        );

        let metrics = bus.metrics();
        assert_eq!(metrics.published, 2);
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.rejected, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_wildcard_subscription_spans_event_types() {
        let bus = EventBus::<Envelope>::new(test_config());
        let wildcard = Arc::new(AtomicU32::new(0));
        let exact = Arc::new(AtomicU32::new(0));
        bus.subscribe("user.*", counting(Arc::clone(&wildcard), false))
            .expect("wildcard");
        bus.subscribe("user.created", counting(Arc::clone(&exact), false))
            .expect("exact");

        let ctx = CancellationToken::new();
        for event_type in ["user.created", "user.deleted", "users.created"] {
            bus.publish(&ctx, Envelope::new(event_type))
                .await
                .expect("publish");
        }

        assert_eq!(wildcard.load(Ordering::SeqCst), 2);
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(bus.history().len(), 3);
    }

    // =============================================================================
    // MIDDLEWARE
    // =============================================================================

    struct Audit {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventMiddleware<Envelope> for Audit {
        fn name(&self) -> &str {
            "audit"
        }

        async fn handle(
            &self,
            ctx: &CancellationToken,
            event: &Envelope,
            next: Next<'_, Envelope>,
        ) -> Result<(), BoxError> {
            let handler = next.handler_name().to_string();
            self.log.lock().push(format!("enter {handler}"));
            let result = next.run(ctx, event).await;
            self.log.lock().push(format!("exit {handler}"));
            result
        }
    }

    #[tokio::test]
    async fn test_middleware_wraps_every_handler() {
        let bus = EventBus::<Envelope>::new(test_config());
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.add_middleware(Arc::new(Audit {
            log: Arc::clone(&log),
        }));

        for (name, priority) in [("first", 2), ("second", 1)] {
            let log = Arc::clone(&log);
            let handler = handler_fn(name, move |_e: Envelope| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(format!("handle {name}"));
                    Ok::<(), BoxError>(())
                }
            });
            bus.subscribe_with_options(
                "message",
                Arc::new(handler),
                SubscriptionOptions::new().priority(priority),
            )
            .expect("subscribe");
        }

        bus.publish(&CancellationToken::new(), Envelope::new("message"))
            .await
            .expect("publish");

        assert_eq!(
            *log.lock(),
            vec![
                "enter first",
                "handle first",
                "exit first",
                "enter second",
                "handle second",
                "exit second",
            ]
        );
    }

    // =============================================================================
    // ASYNCHRONOUS SUBSCRIBERS
    // =============================================================================

    #[tokio::test]
    async fn test_async_subscribers_drain_on_stop() {
        let bus = EventBus::<Envelope>::new(test_config());
        let completed = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&completed);
        bus.subscribe_with_options(
            "report.requested",
            Arc::new(handler_fn("slow-report", move |_e: Envelope| {
                let counter = Arc::clone(&counter);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), BoxError>(())
                }
            })),
            SubscriptionOptions::new().asynchronous(),
        )
        .expect("subscribe");
        bus.subscribe_with_options(
            "report.requested",
            counting(Arc::new(AtomicU32::new(0)), true),
            SubscriptionOptions::new().asynchronous(),
        )
        .expect("subscribe");

        let ctx = CancellationToken::new();
        bus.start(&ctx).await.expect("start");
        bus.publish(&ctx, Envelope::new("report.requested"))
            .await
            .expect("async failures never reach the publisher");
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        bus.stop(&ctx).await.expect("stop");
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(bus.metrics().failed, 1);
    }

    // =============================================================================
    // BRIDGE + BATCHING
    // =============================================================================

    #[tokio::test]
    async fn test_bridge_feeds_external_consumer() {
        let bridge = Arc::new(BroadcastBridge::<Envelope>::new());
        let mut rx = bridge.subscribe();
        let bus = EventBus::<Envelope>::new(test_config()).with_bridge(bridge.clone());

        let consumer = tokio::spawn(async move {
            let mut received = Vec::new();
            while received.len() < 3 {
                match rx.recv().await {
                    Ok(event) => received.push(event.payload.as_text().unwrap_or_default().to_string()),
                    Err(_) => break,
                }
            }
            received
        });

        let ctx = CancellationToken::new();
        bus.start(&ctx).await.expect("start");
        for text in ["a", "b", "c"] {
            bus.publish(&ctx, Envelope::text("message", text))
                .await
                .expect("publish");
        }

        let received = timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer finished")
            .expect("consumer task");
        assert_eq!(received, vec!["a", "b", "c"]);
        assert_eq!(bridge.forwarded(), 3);

        bus.stop(&ctx).await.expect("stop");
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl BatchSink<Envelope> for RecordingSink {
        async fn flush(&self, batch: EventBatch<Envelope>) -> Result<(), BoxError> {
            self.batches.lock().push((batch.key.clone(), batch.size()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batch_sink_receives_full_and_final_batches() {
        let mut config = test_config();
        config.batcher = BatcherConfig {
            max_batch_size: 2,
            max_wait: Duration::from_secs(60),
            flush_interval: Duration::from_secs(60),
        };
        let sink = Arc::new(RecordingSink::default());
        let bus = EventBus::<Envelope>::new(config).with_batch_sink(sink.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("metric.sample", recording(Arc::clone(&log), ()))
            .expect("subscribe");

        let ctx = CancellationToken::new();
        bus.start(&ctx).await.expect("start");
        for _ in 0..3 {
            bus.publish(&ctx, Envelope::new("metric.sample"))
                .await
                .expect("publish");
        }
        assert_eq!(*sink.batches.lock(), vec![("metric.sample".to_string(), 2)]);

        bus.stop(&ctx).await.expect("stop");
        assert_eq!(
            *sink.batches.lock(),
            vec![
                ("metric.sample".to_string(), 2),
                ("metric.sample".to_string(), 1),
            ]
        );
        assert_eq!(log.lock().len(), 3);
    }
}
