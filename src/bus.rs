//! Message fan-out bus
//!
//! Fire-and-forget pub/sub: every accepted message is handed to every
//! observer registered when the broadcast starts. Nothing is buffered
//! across broadcasts; stored messages are the durable record.
//!
//! Delivery runs under the read side of the observer lock, so
//! `deregister` (write side) waits for in-flight broadcasts. Once it
//! returns, the observer receives nothing further. An observer registered
//! while a broadcast is running gets the next message, not the current one.

use crate::observability::metrics::metrics;
use crate::protocol::LiveEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handle returned by [`FanoutBus::register`]
pub type ObserverId = u64;

#[derive(Debug, Error, PartialEq)]
pub enum DeliveryError {
    #[error("observer channel closed")]
    Closed,
    /// The reader has fallen too far behind
    #[error("observer queue full")]
    Full,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// A live outbound channel that can accept events without blocking
pub trait Observer: Send + Sync {
    fn deliver(&self, event: &Arc<LiveEvent>) -> Result<(), DeliveryError>;
}

/// Queue depth used by [`ChannelObserver::channel`]
pub const DEFAULT_OBSERVER_QUEUE: usize = 256;

/// Observer backed by a bounded channel drained by a writer task
pub struct ChannelObserver {
    tx: mpsc::Sender<Arc<LiveEvent>>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<Arc<LiveEvent>>) -> Self {
        Self { tx }
    }

    /// Observer plus the receiving half its writer task drains
    pub fn channel() -> (Self, mpsc::Receiver<Arc<LiveEvent>>) {
        Self::with_capacity(DEFAULT_OBSERVER_QUEUE)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Arc<LiveEvent>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl Observer for ChannelObserver {
    fn deliver(&self, event: &Arc<LiveEvent>) -> Result<(), DeliveryError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Multi-consumer notification channel
#[derive(Default)]
pub struct FanoutBus {
    observers: RwLock<HashMap<ObserverId, Arc<dyn Observer>>>,
    next_id: AtomicU64,
}

impl FanoutBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, observer);
        metrics().observer_registered();
        debug!(observer_id = id, "Observer registered");
        id
    }

    /// Idempotent; returns whether the observer was still registered
    pub fn deregister(&self, id: ObserverId) -> bool {
        let removed = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            metrics().observer_deregistered();
            debug!(observer_id = id, "Observer deregistered");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_registered(&self, id: ObserverId) -> bool {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Deliver to every current observer; failing observers are dropped
    pub fn broadcast(&self, event: LiveEvent) -> BroadcastReport {
        let event = Arc::new(event);
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        {
            let observers = self
                .observers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, observer) in observers.iter() {
                match observer.deliver(&event) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!(observer_id = id, error = %e, "Delivery failed, dropping observer");
                        failed.push(*id);
                    }
                }
            }
        }

        for id in failed {
            if self.deregister(id) {
                report.dropped += 1;
            }
        }

        metrics().broadcast_completed(report.delivered as u64, report.dropped as u64);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LiveEvent;

    struct FailingObserver;

    impl Observer for FailingObserver {
        fn deliver(&self, _event: &Arc<LiveEvent>) -> Result<(), DeliveryError> {
            Err(DeliveryError::Failed("socket reset".to_string()))
        }
    }

    #[test]
    fn test_broadcast_reaches_every_observer_once() {
        let bus = FanoutBus::new();
        let (a, mut rx_a) = ChannelObserver::channel();
        let (b, mut rx_b) = ChannelObserver::channel();
        bus.register(Arc::new(a));
        bus.register(Arc::new(b));

        let report = bus.broadcast(LiveEvent::connection_established());

        assert_eq!(report.delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_failing_observer_isolated_and_dropped() {
        let bus = FanoutBus::new();
        let (a, mut rx_a) = ChannelObserver::channel();
        let (c, mut rx_c) = ChannelObserver::channel();
        bus.register(Arc::new(a));
        let bad = bus.register(Arc::new(FailingObserver));
        bus.register(Arc::new(c));

        let report = bus.broadcast(LiveEvent::connection_established());

        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 1);
        assert!(!bus.is_registered(bad));
        assert_eq!(bus.observer_count(), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
    }

    #[test]
    fn test_closed_channel_is_dropped() {
        let bus = FanoutBus::new();
        let (a, rx_a) = ChannelObserver::channel();
        let id = bus.register(Arc::new(a));
        drop(rx_a);

        let report = bus.broadcast(LiveEvent::connection_established());
        assert_eq!(report.dropped, 1);
        assert!(!bus.is_registered(id));
    }

    #[test]
    fn test_full_queue_drops_slow_observer() {
        let bus = FanoutBus::new();
        let (slow, mut rx_slow) = ChannelObserver::with_capacity(2);
        let (fast, mut rx_fast) = ChannelObserver::channel();
        let slow_id = bus.register(Arc::new(slow));
        bus.register(Arc::new(fast));

        for _ in 0..2 {
            assert_eq!(bus.broadcast(LiveEvent::connection_established()).dropped, 0);
        }
        let report = bus.broadcast(LiveEvent::connection_established());

        assert_eq!(report.dropped, 1);
        assert!(!bus.is_registered(slow_id));
        assert_eq!(bus.observer_count(), 1);
        let mut fast_received = 0;
        while rx_fast.try_recv().is_ok() {
            fast_received += 1;
        }
        assert_eq!(fast_received, 3);
        let mut slow_received = 0;
        while rx_slow.try_recv().is_ok() {
            slow_received += 1;
        }
        assert_eq!(slow_received, 2);
    }

    #[test]
    fn test_no_delivery_after_deregister() {
        let bus = FanoutBus::new();
        let (a, mut rx_a) = ChannelObserver::channel();
        let id = bus.register(Arc::new(a));

        assert!(bus.deregister(id));
        assert!(!bus.deregister(id));
        bus.broadcast(LiveEvent::connection_established());
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_no_replay_for_late_registration() {
        let bus = FanoutBus::new();
        bus.broadcast(LiveEvent::connection_established());

        let (a, mut rx_a) = ChannelObserver::channel();
        bus.register(Arc::new(a));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_observer_ids_are_unique() {
        let bus = FanoutBus::new();
        let (a, _rx_a) = ChannelObserver::channel();
        let (b, _rx_b) = ChannelObserver::channel();
        assert_ne!(bus.register(Arc::new(a)), bus.register(Arc::new(b)));
    }
}
