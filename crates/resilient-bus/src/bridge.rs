//! # Bridge
//!
//! Forwards events accepted by the bus to another delivery mechanism.
//! The bus starts and stops its bridge together with its own lifecycle and
//! forwards every event that passed the pipeline, rate limiter and breaker.
//!
//! [`BroadcastBridge`] republishes onto a `tokio::sync::broadcast` channel,
//! so external consumers can observe the stream without registering
//! subscriptions.

use crate::error::BusError;
use crate::event::Event;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Default buffer of [`BroadcastBridge`] receivers.
pub const DEFAULT_BRIDGE_CAPACITY: usize = 1000;

#[async_trait]
pub trait Bridge<E: Event>: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), BusError>;

    async fn stop(&self) -> Result<(), BusError>;

    async fn forward(&self, event: &E) -> Result<(), BusError>;
}

/// Bridge onto a broadcast channel.
pub struct BroadcastBridge<E> {
    sender: broadcast::Sender<E>,
    running: AtomicBool,
    forwarded: AtomicU64,
}

impl<E: Event> BroadcastBridge<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BRIDGE_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            running: AtomicBool::new(false),
            forwarded: AtomicU64::new(0),
        }
    }

    /// New receiver for forwarded events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events handed to the channel while running.
    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl<E: Event> Default for BroadcastBridge<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Event> Bridge<E> for BroadcastBridge<E> {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn start(&self) -> Result<(), BusError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(BusError::Bridge {
                bridge: "broadcast".into(),
                reason: "already running".into(),
            });
        }
        info!("[bridge] broadcast bridge started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(BusError::Bridge {
                bridge: "broadcast".into(),
                reason: "not running".into(),
            });
        }
        info!(forwarded = self.forwarded(), "[bridge] broadcast bridge stopped");
        Ok(())
    }

    async fn forward(&self, event: &E) -> Result<(), BusError> {
        if !self.is_running() {
            return Err(BusError::Bridge {
                bridge: "broadcast".into(),
                reason: "not running".into(),
            });
        }

        self.forwarded.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event.clone()) {
            Ok(receivers) => {
                debug!(event_type = %event.event_type(), receivers, "Event bridged");
            }
            Err(_) => {
                // No receivers: nothing to deliver to.
                debug!(event_type = %event.event_type(), "Event bridged with no receivers");
            }
        }
        Ok(())
    }
}
