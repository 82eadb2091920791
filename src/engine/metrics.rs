//! Engine observability counters
//!
//! Per-engine atomic counters for monitoring loop health. In-process
//! only; there is no export surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters owned by one engine instance
#[derive(Debug)]
pub struct EngineMetrics {
    /// Messages transmitted (ACK'd messages count once, on delivery)
    pub messages_sent: AtomicU64,
    /// Messages received and enqueued
    pub messages_received: AtomicU64,
    /// Bytes written to the socket
    pub bytes_sent: AtomicU64,
    /// Bytes read from the socket
    pub bytes_received: AtomicU64,
    /// UDP retransmissions after a missed ACK window
    pub ack_retransmits: AtomicU64,
    /// Messages dropped after exhausting the sender timeout budget
    pub ack_failures: AtomicU64,
    /// Inbound frames dropped because the message box was full
    pub inbound_drops: AtomicU64,
    /// Request/answer exchanges served
    pub answers_served: AtomicU64,
    start_time: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            ack_retransmits: AtomicU64::new(0),
            ack_failures: AtomicU64::new(0),
            inbound_drops: AtomicU64::new(0),
            answers_served: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn ack_retransmit(&self) {
        self.ack_retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_drop(&self) {
        self.inbound_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn answer_served(&self) {
        self.answers_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            ack_retransmits: self.ack_retransmits.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            inbound_drops: self.inbound_drops.load(Ordering::Relaxed),
            answers_served: self.answers_served.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub ack_retransmits: u64,
    pub ack_failures: u64,
    pub inbound_drops: u64,
    pub answers_served: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = EngineMetrics::new();
        metrics.message_sent(10);
        metrics.message_sent(5);
        metrics.message_received(7);
        metrics.ack_retransmit();
        metrics.inbound_drop();

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.bytes_received, 7);
        assert_eq!(snap.ack_retransmits, 1);
        assert_eq!(snap.inbound_drops, 1);
    }
}
