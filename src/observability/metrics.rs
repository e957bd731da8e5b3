//! Thread-safe metrics collection system
//!
//! Atomic counters for broker sessions, message flow, fan-out delivery and
//! browser channels. A single process-wide collector is exposed through
//! [`metrics()`] and served as JSON on `/metrics`.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // Broker sessions
    connect_attempts: AtomicU64,
    connects_established: AtomicU64,
    connect_failures: AtomicU64,
    sessions_active: AtomicU64,
    link_drops: AtomicU64,

    // Message flow
    messages_received: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    persistence_failures: AtomicU64,

    // Fan-out
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    delivery_drops: AtomicU64,
    observers_active: AtomicU64,

    // Browser channels
    channels_opened: AtomicU64,
    ping_timeouts: AtomicU64,
    stalled_channels: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            connects_established: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            link_drops: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_drops: AtomicU64::new(0),
            observers_active: AtomicU64::new(0),
            channels_opened: AtomicU64::new(0),
            ping_timeouts: AtomicU64::new(0),
            stalled_channels: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Broker session metrics
    pub fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_established(&self) {
        self.connects_established.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        saturating_decrement(&self.sessions_active);
    }

    pub fn link_dropped(&self) {
        self.link_drops.fetch_add(1, Ordering::Relaxed);
    }

    // Message flow metrics
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_failed(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Fan-out metrics
    pub fn broadcast_completed(&self, delivered: u64, dropped: u64) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered, Ordering::Relaxed);
        self.delivery_drops.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn observer_registered(&self) {
        self.observers_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observer_deregistered(&self) {
        saturating_decrement(&self.observers_active);
    }

    // Gateway metrics
    pub fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ping_timed_out(&self) {
        self.ping_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_stalled(&self) {
        self.stalled_channels.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            sessions: SessionMetrics {
                connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
                connects_established: self.connects_established.load(Ordering::Relaxed),
                connect_failures: self.connect_failures.load(Ordering::Relaxed),
                active: self.sessions_active.load(Ordering::Relaxed),
                link_drops: self.link_drops.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            },
            fanout: FanoutMetrics {
                broadcasts: self.broadcasts.load(Ordering::Relaxed),
                deliveries: self.deliveries.load(Ordering::Relaxed),
                dropped_observers: self.delivery_drops.load(Ordering::Relaxed),
                observers_active: self.observers_active.load(Ordering::Relaxed),
                channels_opened: self.channels_opened.load(Ordering::Relaxed),
                ping_timeouts: self.ping_timeouts.load(Ordering::Relaxed),
                stalled_channels: self.stalled_channels.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn saturating_decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub sessions: SessionMetrics,
    pub messages: MessageMetrics,
    pub fanout: FanoutMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub connect_attempts: u64,
    pub connects_established: u64,
    pub connect_failures: u64,
    pub active: u64,
    pub link_drops: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub persistence_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanoutMetrics {
    pub broadcasts: u64,
    pub deliveries: u64,
    pub dropped_observers: u64,
    pub observers_active: u64,
    pub channels_opened: u64,
    pub ping_timeouts: u64,
    pub stalled_channels: u64,
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
