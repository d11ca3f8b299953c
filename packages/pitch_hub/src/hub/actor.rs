use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::{HandshakeError, HubError};

use super::hibernation::HibernationAdapter;
use super::protocol::PresenceStatus;
use super::queue::QueueOptions;
use super::registry::Session;
use super::router::{BroadcastReceipt, SendReceipt};
use super::state::{HubContext, HubState, HubStats};
use super::transport::{CloseReason, ConnectionId, SocketHandle};

/// Commands that can be sent to the hub actor
#[derive(Debug)]
pub enum HubCommand {
    Connect {
        socket: SocketHandle,
        session: Session,
        respond_to: oneshot::Sender<Result<(), HandshakeError>>,
    },
    Disconnect {
        id: ConnectionId,
        reason: CloseReason,
        respond_to: oneshot::Sender<()>,
    },
    ClientFrame {
        id: ConnectionId,
        text: String,
        respond_to: oneshot::Sender<()>,
    },
    Broadcast {
        message: Value,
        respond_to: oneshot::Sender<Result<BroadcastReceipt, HubError>>,
    },
    Send {
        user_id: String,
        message: Value,
        options: QueueOptions,
        respond_to: oneshot::Sender<Result<SendReceipt, HubError>>,
    },
    SetPresence {
        user_id: String,
        status: PresenceStatus,
        respond_to: oneshot::Sender<PresenceStatus>,
    },
    Stats {
        respond_to: oneshot::Sender<HubStats>,
    },
}

/// Handle to communicate with the hub actor
#[derive(Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| HubError::ActorGone)?;
        rx.await.map_err(|_| HubError::NoResponse)
    }

    pub async fn connect(&self, socket: SocketHandle, session: Session) -> Result<(), HubError> {
        self.request(|respond_to| HubCommand::Connect {
            socket,
            session,
            respond_to,
        })
        .await?
        .map_err(HubError::from)
    }

    pub async fn disconnect(&self, id: ConnectionId, reason: CloseReason) -> Result<(), HubError> {
        self.request(|respond_to| HubCommand::Disconnect {
            id,
            reason,
            respond_to,
        })
        .await
    }

    pub async fn client_frame(&self, id: ConnectionId, text: String) -> Result<(), HubError> {
        self.request(|respond_to| HubCommand::ClientFrame {
            id,
            text,
            respond_to,
        })
        .await
    }

    pub async fn broadcast(&self, message: Value) -> Result<BroadcastReceipt, HubError> {
        self.request(|respond_to| HubCommand::Broadcast {
            message,
            respond_to,
        })
        .await?
    }

    pub async fn send(
        &self,
        user_id: String,
        message: Value,
        options: QueueOptions,
    ) -> Result<SendReceipt, HubError> {
        self.request(|respond_to| HubCommand::Send {
            user_id,
            message,
            options,
            respond_to,
        })
        .await?
    }

    pub async fn set_presence(
        &self,
        user_id: String,
        status: PresenceStatus,
    ) -> Result<PresenceStatus, HubError> {
        self.request(|respond_to| HubCommand::SetPresence {
            user_id,
            status,
            respond_to,
        })
        .await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|respond_to| HubCommand::Stats { respond_to })
            .await
    }
}

/// Options for spawning the hub actor
pub struct SpawnOptions {
    pub inbox_capacity: usize,
    /// Drop in-memory state whenever the inbox drains.
    pub hibernate_when_idle: bool,
}

/// The single serialized owner of all hub state.
///
/// `state` is `None` while hibernated; the next command rebuilds it from
/// socket attachments before being handled.
pub struct HubActor {
    state: Option<HubState>,
    ctx: HubContext,
    receiver: mpsc::Receiver<HubCommand>,
    hibernate_when_idle: bool,
}

fn resume_if_needed<'a>(slot: &'a mut Option<HubState>, ctx: &HubContext) -> &'a mut HubState {
    slot.get_or_insert_with(|| {
        ctx.metrics.resumed();
        HibernationAdapter::resume(ctx.transport.open_sockets(), &ctx.metrics)
    })
}

impl HubActor {
    /// Spawn the hub actor and return its handle
    pub fn spawn(ctx: HubContext, opts: SpawnOptions) -> HubHandle {
        let (sender, receiver) = mpsc::channel(opts.inbox_capacity.max(1));
        let actor = HubActor {
            state: None,
            ctx,
            receiver,
            hibernate_when_idle: opts.hibernate_when_idle,
        };
        tokio::spawn(async move {
            actor.run().await;
        });
        HubHandle { sender }
    }

    async fn run(mut self) {
        info!(
            hibernate_when_idle = self.hibernate_when_idle,
            "Hub actor started"
        );

        while let Some(cmd) = self.receiver.recv().await {
            self.handle(cmd).await;

            if self.hibernate_when_idle && self.receiver.is_empty() && self.state.take().is_some()
            {
                debug!("Hub inbox drained, hibernating");
            }
        }

        info!("Hub actor stopped");
    }

    async fn handle(&mut self, cmd: HubCommand) {
        let state = resume_if_needed(&mut self.state, &self.ctx);
        let ctx = &self.ctx;

        match cmd {
            HubCommand::Connect {
                socket,
                session,
                respond_to,
            } => {
                let result = state.connect(ctx, socket, session).await;
                let _ = respond_to.send(result);
            }

            HubCommand::Disconnect {
                id,
                reason,
                respond_to,
            } => {
                state.disconnect(ctx, id, reason).await;
                let _ = respond_to.send(());
            }

            HubCommand::ClientFrame {
                id,
                text,
                respond_to,
            } => {
                state.handle_client_frame(ctx, id, &text).await;
                let _ = respond_to.send(());
            }

            HubCommand::Broadcast {
                message,
                respond_to,
            } => {
                let result = state.broadcast(ctx, message).await;
                let _ = respond_to.send(result);
            }

            HubCommand::Send {
                user_id,
                message,
                options,
                respond_to,
            } => {
                let result = state.send(ctx, &user_id, message, options).await;
                let _ = respond_to.send(result);
            }

            HubCommand::SetPresence {
                user_id,
                status,
                respond_to,
            } => {
                let status = state.set_presence(ctx, &user_id, status).await;
                let _ = respond_to.send(status);
            }

            HubCommand::Stats { respond_to } => {
                let _ = respond_to.send(state.stats(ctx).await);
            }
        }
    }
}
