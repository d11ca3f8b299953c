//! Hub state and event handling.
//!
//! `HubState` is everything the hub knows in memory: the registry, the
//! channel index and presence. It is rebuilt from socket attachments after
//! hibernation. `HubContext` holds what outlives it (storage, the transport
//! socket table, metrics).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{HandshakeError, HubError};
use crate::metrics::HubMetrics;

use super::channels::{
    ChannelSubscriptionIndex, GLOBAL_CHANNEL, default_channels_for, may_join, pitch_channel,
};
use super::hibernation::{HibernationAdapter, SessionAttachment};
use super::presence::{PresenceChange, PresenceCounts, PresenceTracker};
use super::protocol::{
    ClientMessage, Inbound, PresenceStatus, ServerMessage, now_millis, parse_client_message,
};
use super::queue::{OfflineMessageQueue, QueueOptions};
use super::registry::{ConnectionRegistry, PortalCounts, Session};
use super::router::{
    BroadcastReceipt, Envelope, Exclude, MessageRouter, RouteReceipt, RouteTarget, Routed,
    SendReceipt,
};
use super::transport::{CloseReason, ConnectionId, SocketHandle, TransportSockets};

/// Long-lived collaborators of the hub.
pub struct HubContext {
    pub queue: OfflineMessageQueue,
    pub transport: Arc<TransportSockets>,
    pub metrics: Arc<HubMetrics>,
}

/// Response body of `GET /stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub total_connections: usize,
    pub unique_users: usize,
    pub queued_messages: u64,
    pub presence: PresenceCounts,
    pub portals: PortalCounts,
}

#[derive(Default)]
pub struct HubState {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) channels: ChannelSubscriptionIndex,
    pub(crate) presence: PresenceTracker,
}

fn envelope_of(message: &ServerMessage) -> Option<Envelope> {
    match Envelope::from_server(message) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            error!(event = message.event_type(), "Failed to serialize event: {}", e);
            None
        }
    }
}

impl HubState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly upgraded socket: defaults channels, presence,
    /// offline backlog, then mark it active.
    pub async fn connect(
        &mut self,
        ctx: &HubContext,
        socket: SocketHandle,
        session: Session,
    ) -> Result<(), HandshakeError> {
        let id = socket.id();
        let user_id = session.user_id.clone();
        let session_id = session.session_id.clone();
        let portal = session.portal_type;
        let defaults = default_channels_for(&session);

        let first = self.registry.register(socket.clone(), session)?;
        self.channels.subscribe(id, defaults);
        let change = self.presence.connected(&user_id, first);
        self.refresh_attachment(id);
        ctx.metrics.connection_opened();
        info!(
            conn = %id,
            user_id = %user_id,
            %portal,
            session_id = %session_id,
            first,
            "Connection registered"
        );

        let mut stale = Vec::new();
        self.reply(
            ctx,
            id,
            &ServerMessage::ConnectionEstablished {
                session_id,
                timestamp: now_millis(),
            },
            &mut stale,
        );
        if let Some(change) = change {
            stale.extend(self.broadcast_presence(ctx, &change).await);
        }

        let report = ctx.queue.flush(&user_id, &socket).await;
        ctx.metrics.queue_flushed(report.delivered, report.expired);
        ctx.metrics.messages_sent(report.delivered);
        if report.failed > 0 {
            ctx.metrics.send_failed(report.failed);
            stale.push(id);
        }

        socket.activate();
        self.reap(ctx, stale).await;
        Ok(())
    }

    /// Tear down a connection the transport reported closed.
    pub async fn disconnect(&mut self, ctx: &HubContext, id: ConnectionId, reason: CloseReason) {
        let stale = self.drop_connection(ctx, id, reason).await;
        self.reap(ctx, stale).await;
    }

    /// One inbound text frame from `id`.
    pub async fn handle_client_frame(&mut self, ctx: &HubContext, id: ConnectionId, text: &str) {
        let Some(entry) = self.registry.get_mut(id) else {
            debug!(conn = %id, "Frame from unregistered connection dropped");
            return;
        };
        entry.session.last_activity = Utc::now();
        let user_id = entry.session.user_id.clone();
        ctx.metrics.message_received();

        let mut stale = Vec::new();
        match parse_client_message(text) {
            Inbound::Malformed => {
                debug!(conn = %id, "Malformed client frame");
                self.reply(
                    ctx,
                    id,
                    &ServerMessage::Error {
                        message: "Invalid message format".to_string(),
                    },
                    &mut stale,
                );
            }
            Inbound::Unknown(kind) => {
                debug!(conn = %id, kind, "Ignoring unknown message type");
            }
            Inbound::Message(message) => {
                stale = self.handle_client_message(ctx, id, &user_id, message).await;
            }
        }
        self.reap(ctx, stale).await;
    }

    async fn handle_client_message(
        &mut self,
        ctx: &HubContext,
        id: ConnectionId,
        user_id: &str,
        message: ClientMessage,
    ) -> Vec<ConnectionId> {
        let mut stale = Vec::new();
        match message {
            ClientMessage::Subscribe { channels } => {
                let Some(entry) = self.registry.get(id) else {
                    return stale;
                };
                let (allowed, denied): (Vec<String>, Vec<String>) = channels
                    .into_iter()
                    .partition(|c| may_join(&entry.session, c));
                if !denied.is_empty() {
                    warn!(conn = %id, user_id, ?denied, "Refused channel subscription");
                }
                self.channels.subscribe(id, allowed.iter().cloned());
                self.refresh_attachment(id);
                self.reply(
                    ctx,
                    id,
                    &ServerMessage::Subscribed { channels: allowed },
                    &mut stale,
                );
            }
            ClientMessage::Unsubscribe { channels } => {
                let removed = self.channels.unsubscribe(id, &channels);
                self.refresh_attachment(id);
                self.reply(
                    ctx,
                    id,
                    &ServerMessage::Unsubscribed { channels: removed },
                    &mut stale,
                );
            }
            ClientMessage::Message {
                target_user_id,
                content,
            } => {
                if target_user_id.trim().is_empty() {
                    self.reply(
                        ctx,
                        id,
                        &ServerMessage::Error {
                            message: "targetUserId is required".to_string(),
                        },
                        &mut stale,
                    );
                    return stale;
                }
                let event = ServerMessage::UserMessage {
                    from: user_id.to_string(),
                    data: content,
                    timestamp: now_millis(),
                };
                if let Some(envelope) = envelope_of(&event) {
                    stale = self
                        .dispatch(ctx, RouteTarget::User(&target_user_id), &envelope)
                        .await
                        .stale;
                }
            }
            ClientMessage::Typing {
                pitch_id,
                is_typing,
            } => {
                let channel = pitch_channel(&pitch_id);
                let event = ServerMessage::UserTyping {
                    user_id: user_id.to_string(),
                    pitch_id,
                    is_typing,
                    timestamp: now_millis(),
                };
                if let Some(envelope) = envelope_of(&event) {
                    let target = RouteTarget::Channel {
                        channel: &channel,
                        exclude: Exclude::Connection(id),
                    };
                    stale = self.dispatch(ctx, target, &envelope).await.stale;
                }
            }
            ClientMessage::Presence { status } => {
                stale = self.apply_presence(ctx, user_id, status).await;
            }
            ClientMessage::Ping => {
                self.reply(
                    ctx,
                    id,
                    &ServerMessage::Pong {
                        timestamp: now_millis(),
                    },
                    &mut stale,
                );
            }
        }
        stale
    }

    /// `POST /broadcast`: every session that passes the portal filter.
    pub async fn broadcast(
        &mut self,
        ctx: &HubContext,
        message: Value,
    ) -> Result<BroadcastReceipt, HubError> {
        let envelope = Envelope::from_value(message)?;
        let routed = self.dispatch(ctx, RouteTarget::Broadcast, &envelope).await;
        let receipt = match routed.receipt {
            RouteReceipt::Fanout(receipt) => receipt,
            RouteReceipt::Sent(_) => BroadcastReceipt::default(),
        };
        info!(
            event = %envelope.event_type,
            delivered = receipt.delivered,
            total = receipt.total,
            "Broadcast"
        );
        self.reap(ctx, routed.stale).await;
        Ok(receipt)
    }

    /// `POST /send`: one user, queued when offline.
    pub async fn send(
        &mut self,
        ctx: &HubContext,
        user_id: &str,
        message: Value,
        options: QueueOptions,
    ) -> Result<SendReceipt, HubError> {
        let envelope = Envelope::from_value(message)?.with_queue_options(options);
        let routed = self
            .dispatch(ctx, RouteTarget::User(user_id), &envelope)
            .await;
        let receipt = match routed.receipt {
            RouteReceipt::Sent(receipt) => receipt,
            RouteReceipt::Fanout(_) => SendReceipt::Queued,
        };
        self.reap(ctx, routed.stale).await;
        Ok(receipt)
    }

    /// `POST /presence`: override a user's status.
    pub async fn set_presence(
        &mut self,
        ctx: &HubContext,
        user_id: &str,
        status: PresenceStatus,
    ) -> PresenceStatus {
        let stale = self.apply_presence(ctx, user_id, status).await;
        self.reap(ctx, stale).await;
        status
    }

    pub async fn stats(&self, ctx: &HubContext) -> HubStats {
        HubStats {
            total_connections: self.registry.len(),
            unique_users: self.registry.unique_users(),
            queued_messages: ctx.queue.total().await,
            presence: self.presence.counts(),
            portals: self.registry.portal_counts(),
        }
    }

    async fn apply_presence(
        &mut self,
        ctx: &HubContext,
        user_id: &str,
        status: PresenceStatus,
    ) -> Vec<ConnectionId> {
        let Some(change) = self.presence.set_status(user_id, status) else {
            return Vec::new();
        };
        for id in self.registry.connections_for_user(user_id) {
            self.refresh_attachment(id);
        }
        self.broadcast_presence(ctx, &change).await
    }

    /// `user.presence` to `global`, minus the subject's own connections.
    async fn broadcast_presence(
        &self,
        ctx: &HubContext,
        change: &PresenceChange,
    ) -> Vec<ConnectionId> {
        let Some(envelope) = envelope_of(&change.to_message()) else {
            return Vec::new();
        };
        debug!(user_id = %change.user_id, status = ?change.status, "Presence changed");
        let target = RouteTarget::Channel {
            channel: GLOBAL_CHANNEL,
            exclude: Exclude::User(&change.user_id),
        };
        self.dispatch(ctx, target, &envelope).await.stale
    }

    async fn dispatch(
        &self,
        ctx: &HubContext,
        target: RouteTarget<'_>,
        envelope: &Envelope,
    ) -> Routed<RouteReceipt> {
        let routed = MessageRouter::new(&self.registry, &self.channels)
            .route(&ctx.queue, target, envelope)
            .await;
        match &routed.receipt {
            RouteReceipt::Sent(SendReceipt::Delivered { connections }) => {
                ctx.metrics.messages_sent(*connections)
            }
            RouteReceipt::Sent(SendReceipt::Queued) => ctx.metrics.message_queued(),
            RouteReceipt::Fanout(receipt) => ctx.metrics.messages_sent(receipt.delivered),
        }
        ctx.metrics.send_failed(routed.stale.len());
        routed
    }

    /// Direct reply to one connection.
    fn reply(
        &self,
        ctx: &HubContext,
        id: ConnectionId,
        message: &ServerMessage,
        stale: &mut Vec<ConnectionId>,
    ) {
        let Some(entry) = self.registry.get(id) else {
            return;
        };
        let Some(envelope) = envelope_of(message) else {
            return;
        };
        match entry.socket.send(envelope.frame()) {
            Ok(()) => ctx.metrics.messages_sent(1),
            Err(e) => {
                warn!(conn = %id, event = message.event_type(), "Reply failed: {}", e);
                ctx.metrics.send_failed(1);
                stale.push(id);
            }
        }
    }

    /// Rewrite the socket attachment from current state.
    fn refresh_attachment(&self, id: ConnectionId) {
        let Some(entry) = self.registry.get(id) else {
            return;
        };
        let status = self.presence.status_of(&entry.session.user_id);
        let presence = (status != PresenceStatus::Online).then_some(status);
        let attachment =
            SessionAttachment::new(&entry.session, self.channels.channels_of(id), presence);
        HibernationAdapter::attach(&entry.socket, &attachment);
    }

    /// Unregister `id` and purge it everywhere. Returns connections that
    /// failed while the resulting presence change was broadcast.
    async fn drop_connection(
        &mut self,
        ctx: &HubContext,
        id: ConnectionId,
        reason: CloseReason,
    ) -> Vec<ConnectionId> {
        let Some(removed) = self.registry.unregister(id) else {
            return Vec::new();
        };
        self.channels.remove_connection(id);
        removed.socket.close(reason);
        ctx.metrics.connection_closed();
        info!(
            conn = %id,
            user_id = %removed.session.user_id,
            reason = reason.as_str(),
            last = removed.was_last_for_user,
            "Connection unregistered"
        );

        if !removed.was_last_for_user {
            return Vec::new();
        }
        match self.presence.disconnected(&removed.session.user_id) {
            Some(change) => self.broadcast_presence(ctx, &change).await,
            None => Vec::new(),
        }
    }

    /// Unregister failed connections until no new failures turn up.
    async fn reap(&mut self, ctx: &HubContext, stale: Vec<ConnectionId>) {
        let mut pending = stale;
        while let Some(id) = pending.pop() {
            let more = self
                .drop_connection(ctx, id, CloseReason::SendFailure)
                .await;
            pending.extend(more);
        }
    }
}
