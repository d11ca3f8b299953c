//! Offline Message Queue
//!
//! Bounded, TTL'd per-user backlog persisted in SQLite. Each user's queue is
//! a single JSON array row keyed by `queue:<userId>`, oldest first.
//!
//! Delivery is at-most-once: a flush clears the stored backlog whether or
//! not every entry reached the socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::repository::{HubRepository, queue_key};

use super::protocol::now_millis;
use super::transport::SocketHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// How a targeted event is stored if its recipient turns out to be offline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    #[serde(default)]
    pub priority: Priority,
    /// Falls back to the queue's default TTL.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    /// Delivered verbatim on flush.
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    /// Milliseconds since the Unix epoch.
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl QueuedMessage {
    /// Wrap an outbound event for `target_user_id`. The kind is taken from
    /// the payload's `type` field.
    pub fn for_user(target_user_id: &str, payload: Value) -> Self {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message")
            .to_string();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            target_user_id: Some(target_user_id.to_string()),
            payload,
            priority: Priority::default(),
            enqueued_at: now_millis(),
            ttl_seconds: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_options(self, options: QueueOptions) -> Self {
        let message = self.with_priority(options.priority);
        match options.ttl_seconds {
            Some(ttl) => message.with_ttl(ttl),
            None => message,
        }
    }

    pub fn is_expired_at(&self, now_ms: i64, default_ttl_secs: u64) -> bool {
        let ttl_ms = self.ttl_seconds.unwrap_or(default_ttl_secs).saturating_mul(1000);
        let ttl_ms = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
        now_ms > self.enqueued_at.saturating_add(ttl_ms)
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub expired: usize,
    /// Entries lost because the socket stopped accepting frames.
    pub failed: usize,
}

pub struct OfflineMessageQueue {
    repository: HubRepository,
    capacity: usize,
    default_ttl_secs: u64,
}

impl OfflineMessageQueue {
    pub fn new(repository: HubRepository, capacity: usize, default_ttl_secs: u64) -> Self {
        Self {
            repository,
            capacity: capacity.max(1),
            default_ttl_secs,
        }
    }

    /// Stored backlog, or `None` if there is none or it could not be read.
    async fn load(&self, key: &str) -> Option<Vec<QueuedMessage>> {
        let raw = match self.repository.load_queue(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, "Failed to load offline queue: {}", e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(messages) => Some(messages),
            Err(e) => {
                warn!(key, "Discarding unreadable offline queue: {}", e);
                Some(Vec::new())
            }
        }
    }

    /// Append for `user_id`, keeping only the newest `capacity` entries.
    /// Returns the backlog length after the append.
    pub async fn enqueue(&self, user_id: &str, mut message: QueuedMessage) -> usize {
        let key = queue_key(user_id);
        if message.ttl_seconds.is_none() {
            message.ttl_seconds = Some(self.default_ttl_secs);
        }

        let mut messages = self.load(&key).await.unwrap_or_default();
        messages.push(message);
        if messages.len() > self.capacity {
            let overflow = messages.len() - self.capacity;
            messages.drain(..overflow);
            debug!(user_id, overflow, "Offline queue full, dropped oldest");
        }

        match serde_json::to_string(&messages) {
            Ok(json) => {
                if let Err(e) = self
                    .repository
                    .store_queue(&key, &json, messages.len())
                    .await
                {
                    warn!(user_id, "Failed to persist offline queue: {}", e);
                }
            }
            Err(e) => warn!(user_id, "Failed to serialize offline queue: {}", e),
        }
        messages.len()
    }

    /// Deliver the backlog to a freshly connected socket, then clear it.
    pub async fn flush(&self, user_id: &str, socket: &SocketHandle) -> FlushReport {
        self.flush_at(user_id, socket, now_millis()).await
    }

    pub async fn flush_at(&self, user_id: &str, socket: &SocketHandle, now_ms: i64) -> FlushReport {
        let key = queue_key(user_id);
        let Some(messages) = self.load(&key).await else {
            return FlushReport::default();
        };

        let mut report = FlushReport::default();
        let mut pending = messages.into_iter();
        for message in pending.by_ref() {
            if message.is_expired_at(now_ms, self.default_ttl_secs) {
                report.expired += 1;
                continue;
            }
            let frame = match serde_json::to_string(&message.payload) {
                Ok(json) => json,
                Err(e) => {
                    warn!(user_id, id = %message.id, "Failed to serialize queued message: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            if let Err(e) = socket.send(Arc::from(frame)) {
                warn!(user_id, conn = %socket.id(), "Offline flush interrupted: {}", e);
                report.failed += 1;
                break;
            }
            report.delivered += 1;
        }
        report.failed += pending.count();

        if let Err(e) = self.repository.delete_queue(&key).await {
            warn!(user_id, "Failed to clear offline queue: {}", e);
        }
        debug!(
            user_id,
            delivered = report.delivered,
            expired = report.expired,
            failed = report.failed,
            "Flushed offline queue"
        );
        report
    }

    /// Stored backlog length for `user_id` (0 when unreadable).
    pub async fn len(&self, user_id: &str) -> usize {
        self.load(&queue_key(user_id))
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Messages waiting across all users.
    pub async fn total(&self) -> u64 {
        match self.repository.queued_total().await {
            Ok(total) => total,
            Err(e) => {
                warn!("Failed to count offline queues: {}", e);
                0
            }
        }
    }
}
