//! WebSocket Handler
//!
//! One task per upgraded socket. Outbound frames are drained from the
//! socket's buffer; inbound text is forwarded to the hub actor, except the
//! transport-level ping token, which is answered here without waking the
//! hub and without counting as activity.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::HubMetrics;

use super::actor::HubHandle;
use super::registry::Session;
use super::transport::{CloseReason, TransportSockets};

/// Everything a connection task needs besides the socket itself.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub hub: HubHandle,
    pub transport: Arc<TransportSockets>,
    pub metrics: Arc<HubMetrics>,
    pub send_channel_capacity: usize,
}

/// Drive one hub connection until it closes.
pub async fn handle_hub_socket(socket: WebSocket, deps: ConnectionDeps, session: Session) {
    let ConnectionDeps {
        hub,
        transport,
        metrics,
        send_channel_capacity,
    } = deps;

    let (handle, mut outbound) = transport.open(send_channel_capacity);
    let id = handle.id();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    info!(conn = %id, user_id = %session.user_id, portal = %session.portal_type, "New hub connection");

    let auto_response = transport.auto_response().cloned();
    let max_idle = transport.max_idle();

    // Task to send buffered frames to the WebSocket. Runs before the hub
    // registers the socket so the offline backlog drains as it is flushed.
    let sender_task = async {
        while let Some(frame) = outbound.recv().await {
            if ws_sender
                .send(Message::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                return CloseReason::SocketError;
            }
        }
        CloseReason::SocketError
    };

    // Task to register with the hub, then handle incoming messages.
    // Yields None if the hub refused the connection.
    let input_task = async {
        if let Err(e) = hub.connect(handle.clone(), session).await {
            warn!(conn = %id, "Hub refused connection: {}", e);
            return None;
        }

        let mut deadline = max_idle.map(|d| Instant::now() + d);
        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, ws_receiver.next()).await {
                    Ok(next) => next,
                    Err(_) => return Some(CloseReason::IdleTimeout),
                },
                None => ws_receiver.next().await,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    if let Some(auto) = auto_response.as_ref() {
                        if text.as_str() == auto.request {
                            metrics.auto_replied();
                            if handle.send(Arc::from(auto.response.as_str())).is_err() {
                                return Some(CloseReason::SendFailure);
                            }
                            continue;
                        }
                    }
                    deadline = max_idle.map(|d| Instant::now() + d);
                    if let Err(e) = hub.client_frame(id, text.to_string()).await {
                        warn!(conn = %id, "Failed to forward frame: {}", e);
                        return Some(CloseReason::SocketError);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(conn = %id, "Client closed connection");
                    return Some(CloseReason::ClientClose);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(conn = %id, "WebSocket error: {}", e);
                    return Some(CloseReason::SocketError);
                }
            }
        }
    };

    let reason = tokio::select! {
        reason = sender_task => Some(reason),
        reason = input_task => reason,
        _ = handle.closed() => Some(handle.close_reason().unwrap_or(CloseReason::SendFailure)),
    };

    let Some(reason) = reason else {
        transport.release(id);
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    };

    if reason != CloseReason::ClientClose {
        let _ = ws_sender.send(Message::Close(None)).await;
    }

    if let Err(e) = hub.disconnect(id, reason).await {
        warn!(conn = %id, "Failed to report disconnect: {}", e);
    }
    transport.release(id);
    info!(conn = %id, reason = reason.as_str(), "Hub connection closed");
}
