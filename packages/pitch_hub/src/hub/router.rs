//! Message Router
//!
//! Picks recipients for an outbound event (one user, every session, or one
//! channel), writes the shared frame to each socket, and falls back to the
//! offline queue when a targeted user has no live connection.
//!
//! A failed write never fails the route; the connection id is returned in
//! `stale` for the caller to unregister.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::channels::ChannelSubscriptionIndex;
use super::protocol::{PortalType, ServerMessage};
use super::queue::{OfflineMessageQueue, QueueOptions, QueuedMessage};
use super::registry::ConnectionRegistry;
use super::transport::{ConnectionId, Frame};

/// An outbound event serialized once and shared by every recipient.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event_type: String,
    pub payload: Value,
    /// Applied only if the event ends up in the offline queue.
    pub queue_options: QueueOptions,
    frame: Frame,
}

impl Envelope {
    pub fn from_value(payload: Value) -> serde_json::Result<Self> {
        let frame: Frame = Arc::from(serde_json::to_string(&payload)?);
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            event_type,
            payload,
            queue_options: QueueOptions::default(),
            frame,
        })
    }

    pub fn with_queue_options(mut self, queue_options: QueueOptions) -> Self {
        self.queue_options = queue_options;
        self
    }

    /// Hub-originated events keep their declared field order on the wire,
    /// with `type` first.
    pub fn from_server(message: &ServerMessage) -> serde_json::Result<Self> {
        Ok(Self {
            event_type: message.event_type().to_string(),
            payload: serde_json::to_value(message)?,
            queue_options: QueueOptions::default(),
            frame: Arc::from(serde_json::to_string(message)?),
        })
    }

    pub fn frame(&self) -> Frame {
        self.frame.clone()
    }
}

/// Portal filter for broadcasts.
pub fn should_receive(portal: PortalType, event_type: &str) -> bool {
    if event_type.starts_with("investment.") {
        portal == PortalType::Investor
    } else if event_type.starts_with("production.") {
        portal == PortalType::Production
    } else {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Exclude<'a> {
    Nobody,
    Connection(ConnectionId),
    User(&'a str),
}

#[derive(Debug, Clone, Copy)]
pub enum RouteTarget<'a> {
    User(&'a str),
    Broadcast,
    Channel {
        channel: &'a str,
        exclude: Exclude<'a>,
    },
}

/// Result of a targeted send, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SendReceipt {
    Delivered { connections: usize },
    Queued,
}

/// Successful writes against the filtered recipient set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReceipt {
    pub delivered: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteReceipt {
    Sent(SendReceipt),
    Fanout(BroadcastReceipt),
}

#[derive(Debug)]
pub struct Routed<T> {
    pub receipt: T,
    /// Connections whose write failed.
    pub stale: Vec<ConnectionId>,
}

pub struct MessageRouter<'a> {
    registry: &'a ConnectionRegistry,
    channels: &'a ChannelSubscriptionIndex,
}

impl<'a> MessageRouter<'a> {
    pub fn new(registry: &'a ConnectionRegistry, channels: &'a ChannelSubscriptionIndex) -> Self {
        Self { registry, channels }
    }

    pub async fn route(
        &self,
        queue: &OfflineMessageQueue,
        target: RouteTarget<'_>,
        envelope: &Envelope,
    ) -> Routed<RouteReceipt> {
        match target {
            RouteTarget::User(user_id) => {
                let routed = self.send_to_user(queue, user_id, envelope).await;
                Routed {
                    receipt: RouteReceipt::Sent(routed.receipt),
                    stale: routed.stale,
                }
            }
            RouteTarget::Broadcast => {
                let routed = self.broadcast(envelope);
                Routed {
                    receipt: RouteReceipt::Fanout(routed.receipt),
                    stale: routed.stale,
                }
            }
            RouteTarget::Channel { channel, exclude } => {
                let routed = self.to_channel(channel, exclude, envelope);
                Routed {
                    receipt: RouteReceipt::Fanout(routed.receipt),
                    stale: routed.stale,
                }
            }
        }
    }

    /// Every live connection of `user_id`, or the offline queue when none
    /// accepted the frame.
    pub async fn send_to_user(
        &self,
        queue: &OfflineMessageQueue,
        user_id: &str,
        envelope: &Envelope,
    ) -> Routed<SendReceipt> {
        let recipients = self.recipients(RouteTarget::User(user_id), &envelope.event_type);
        let routed = self.deliver(&recipients, envelope);

        let receipt = if routed.receipt.delivered > 0 {
            SendReceipt::Delivered {
                connections: routed.receipt.delivered,
            }
        } else {
            let message = QueuedMessage::for_user(user_id, envelope.payload.clone())
                .with_options(envelope.queue_options);
            let queued = queue.enqueue(user_id, message).await;
            debug!(user_id, queued, event = %envelope.event_type, "Queued for offline user");
            SendReceipt::Queued
        };
        Routed {
            receipt,
            stale: routed.stale,
        }
    }

    pub fn broadcast(&self, envelope: &Envelope) -> Routed<BroadcastReceipt> {
        let recipients = self.recipients(RouteTarget::Broadcast, &envelope.event_type);
        self.deliver(&recipients, envelope)
    }

    pub fn to_channel(
        &self,
        channel: &str,
        exclude: Exclude<'_>,
        envelope: &Envelope,
    ) -> Routed<BroadcastReceipt> {
        let recipients =
            self.recipients(RouteTarget::Channel { channel, exclude }, &envelope.event_type);
        self.deliver(&recipients, envelope)
    }

    /// Recipient ids for `target`, ascending.
    pub fn recipients(&self, target: RouteTarget<'_>, event_type: &str) -> Vec<ConnectionId> {
        match target {
            RouteTarget::User(user_id) => self.registry.connections_for_user(user_id),
            RouteTarget::Broadcast => {
                let mut ids: Vec<ConnectionId> = self
                    .registry
                    .iter()
                    .filter(|(_, entry)| should_receive(entry.session.portal_type, event_type))
                    .map(|(id, _)| *id)
                    .collect();
                ids.sort();
                ids
            }
            RouteTarget::Channel { channel, exclude } => self
                .channels
                .subscribers_of(channel)
                .into_iter()
                .filter(|id| match exclude {
                    Exclude::Nobody => true,
                    Exclude::Connection(skip) => *id != skip,
                    Exclude::User(user_id) => self
                        .registry
                        .get(*id)
                        .is_none_or(|entry| entry.session.user_id != user_id),
                })
                .collect(),
        }
    }

    fn deliver(&self, recipients: &[ConnectionId], envelope: &Envelope) -> Routed<BroadcastReceipt> {
        let mut receipt = BroadcastReceipt {
            delivered: 0,
            total: recipients.len(),
        };
        let mut stale = Vec::new();
        for id in recipients {
            let Some(entry) = self.registry.get(*id) else {
                debug!(conn = %id, "Recipient no longer registered");
                continue;
            };
            match entry.socket.send(envelope.frame()) {
                Ok(()) => receipt.delivered += 1,
                Err(e) => {
                    warn!(
                        conn = %id,
                        user_id = %entry.session.user_id,
                        event = %envelope.event_type,
                        "Send failed, scheduling unregister: {}",
                        e
                    );
                    stale.push(*id);
                }
            }
        }
        Routed { receipt, stale }
    }
}
