//! Hibernation Adapter
//!
//! Session metadata is serialized onto each socket at connect time and
//! rewritten whenever its subscriptions or presence change. After a
//! suspension the hub state is rebuilt solely from the sockets the
//! transport still reports as open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::metrics::HubMetrics;

use super::protocol::{PortalType, PresenceStatus};
use super::registry::{DeviceInfo, Session};
use super::state::HubState;
use super::transport::{AutoResponse, CloseReason, SocketHandle, TransportSockets};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAttachment {
    pub session_id: String,
    pub user_id: String,
    pub portal_type: PortalType,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub device_info: DeviceInfo,
    /// Set only when the user's status differs from the derived `online`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceStatus>,
}

impl SessionAttachment {
    pub fn new(session: &Session, subscriptions: Vec<String>, presence: Option<PresenceStatus>) -> Self {
        Self {
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            portal_type: session.portal_type,
            connected_at: session.connected_at,
            subscriptions,
            device_info: session.device_info.clone(),
            presence,
        }
    }

    /// The session this attachment describes. Activity restarts at resume.
    pub fn to_session(&self) -> Session {
        Session {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            portal_type: self.portal_type,
            connected_at: self.connected_at,
            last_activity: Utc::now(),
            device_info: self.device_info.clone(),
        }
    }
}

pub struct HibernationAdapter;

impl HibernationAdapter {
    /// Store the attachment on the socket itself.
    pub fn attach(socket: &SocketHandle, attachment: &SessionAttachment) {
        if let Err(e) = socket.serialize_attachment(attachment) {
            tracing::error!(conn = %socket.id(), "Failed to serialize session attachment: {}", e);
        }
    }

    /// Rebuild hub state from every socket still open.
    ///
    /// Sockets without an attachment have not been through `connect` yet and
    /// are left alone. Sockets whose attachment cannot be read are closed and
    /// taken off the active connection count here.
    pub fn resume(sockets: Vec<SocketHandle>, metrics: &HubMetrics) -> HubState {
        let mut state = HubState::new();

        for socket in sockets {
            let attachment: SessionAttachment = match socket.deserialize_attachment() {
                None => {
                    debug!(conn = %socket.id(), "Socket has no attachment yet, skipping");
                    continue;
                }
                Some(Err(e)) => {
                    warn!(conn = %socket.id(), "Unreadable session attachment, closing: {}", e);
                    socket.close(CloseReason::SocketError);
                    metrics.connection_closed();
                    continue;
                }
                Some(Ok(a)) => a,
            };

            let id = socket.id();
            let session = attachment.to_session();
            let user_id = session.user_id.clone();
            if let Err(e) = state.registry.register(socket.clone(), session) {
                warn!(conn = %id, "Attachment rejected on resume, closing: {}", e);
                socket.close(CloseReason::SocketError);
                metrics.connection_closed();
                continue;
            }
            state.channels.subscribe(id, attachment.subscriptions);
            state
                .presence
                .restore(&user_id, attachment.presence.unwrap_or(PresenceStatus::Online));
        }

        if state.registry.is_empty() {
            debug!("Hub resumed with no open connections");
        } else {
            debug!(
                connections = state.registry.len(),
                users = state.registry.unique_users(),
                "Hub state resumed from socket attachments"
            );
        }
        state
    }

    /// Transport settings that must hold without waking the hub.
    pub fn configure_transport(config: &HubConfig) -> TransportSockets {
        let auto_response = if config.ping_token.is_empty() || config.pong_token.is_empty() {
            None
        } else {
            Some(AutoResponse {
                request: config.ping_token.clone(),
                response: config.pong_token.clone(),
            })
        };
        info!(
            auto_reply = auto_response.is_some(),
            max_idle = ?config.max_idle,
            "Transport configured"
        );
        TransportSockets::new(auto_response, config.max_idle)
    }
}
