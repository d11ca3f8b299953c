//! Hub metrics for observability
//!
//! Counters live outside the hub actor so they survive hibernation and can be
//! read without waking it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct HubMetrics {
    // Connection metrics
    /// Currently registered connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Message metrics
    /// Client frames handled by the hub
    pub messages_received: AtomicU64,
    /// Frames written to sockets
    pub messages_sent: AtomicU64,
    /// Per-connection writes that failed
    pub send_failures: AtomicU64,
    /// Pings answered by the transport without waking the hub
    pub auto_replies: AtomicU64,

    // Offline queue metrics
    pub messages_queued: AtomicU64,
    pub queued_flushed: AtomicU64,
    pub queued_expired: AtomicU64,

    /// State rebuilds from socket attachments
    pub resumes: AtomicU64,

    start_time: Option<Instant>,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_sent(&self, count: usize) {
        self.messages_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn send_failed(&self, count: usize) {
        self.send_failures.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn auto_replied(&self) {
        self.auto_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_flushed(&self, delivered: usize, expired: usize) {
        self.queued_flushed
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.queued_expired
            .fetch_add(expired as u64, Ordering::Relaxed);
    }

    pub fn resumed(&self) {
        self.resumes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                sent: self.messages_sent.load(Ordering::Relaxed),
                send_failures: self.send_failures.load(Ordering::Relaxed),
                auto_replies: self.auto_replies.load(Ordering::Relaxed),
            },
            queue: QueueMetrics {
                queued: self.messages_queued.load(Ordering::Relaxed),
                flushed: self.queued_flushed.load(Ordering::Relaxed),
                expired: self.queued_expired.load(Ordering::Relaxed),
            },
            resumes: self.resumes.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub queue: QueueMetrics,
    pub resumes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub auto_replies: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queued: u64,
    pub flushed: u64,
    pub expired: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub uptime_secs: u64,
}
