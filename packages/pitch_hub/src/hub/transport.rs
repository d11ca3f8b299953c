//! Transport-level socket table.
//!
//! Owned outside the hub actor so that open sockets, and the session
//! attachment serialized onto each of them, outlive actor hibernation.

use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

/// Serialized outbound frame, shared between all recipients of one event.
pub type Frame = Arc<str>;

/// Stable handle id for one live socket.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// connecting → active → closing → closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClose,
    IdleTimeout,
    SendFailure,
    SocketError,
    ServerShutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClose => "client-close",
            CloseReason::IdleTimeout => "idle-timeout",
            CloseReason::SendFailure => "send-failure",
            CloseReason::SocketError => "socket-error",
            CloseReason::ServerShutdown => "server-shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("outbound buffer full")]
    Full,
}

/// Fixed request/response pair answered by the transport itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoResponse {
    pub request: String,
    pub response: String,
}

struct SocketState {
    phase: ConnectionPhase,
    attachment: Option<String>,
    close_reason: Option<CloseReason>,
}

struct SocketInner {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    state: Mutex<SocketState>,
    close: CancellationToken,
}

/// Handle to one open duplex socket.
#[derive(Clone)]
pub struct SocketHandle {
    inner: Arc<SocketInner>,
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.inner.id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl SocketHandle {
    fn new(id: ConnectionId, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id,
                tx,
                state: Mutex::new(SocketState {
                    phase: ConnectionPhase::Connecting,
                    attachment: None,
                    close_reason: None,
                }),
                close: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SocketState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Queue a frame for the writer task. Never blocks.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.inner.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state().phase
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.phase(),
            ConnectionPhase::Connecting | ConnectionPhase::Active
        )
    }

    /// Promote a connecting socket to active. No-op once closing.
    pub fn activate(&self) {
        let mut state = self.state();
        if state.phase == ConnectionPhase::Connecting {
            state.phase = ConnectionPhase::Active;
        }
    }

    /// Begin closing. The first reason wins; the socket task observes
    /// [`SocketHandle::closed`] and tears the socket down.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state();
            if matches!(
                state.phase,
                ConnectionPhase::Closing | ConnectionPhase::Closed
            ) {
                return;
            }
            state.phase = ConnectionPhase::Closing;
            state.close_reason = Some(reason);
        }
        debug!(conn = %self.id(), reason = reason.as_str(), "Closing socket");
        self.inner.close.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state().close_reason
    }

    /// Resolves once [`SocketHandle::close`] has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.close.cancelled()
    }

    /// Serialize `value` and store it on the socket itself.
    pub fn serialize_attachment<T: Serialize>(&self, value: &T) -> serde_json::Result<()> {
        let json = serde_json::to_string(value)?;
        self.state().attachment = Some(json);
        Ok(())
    }

    /// Read back the attachment. `None` if nothing was ever attached.
    pub fn deserialize_attachment<T: DeserializeOwned>(&self) -> Option<serde_json::Result<T>> {
        let raw = self.state().attachment.clone()?;
        Some(serde_json::from_str(&raw))
    }

    fn mark_closed(&self) {
        self.state().phase = ConnectionPhase::Closed;
        self.inner.close.cancel();
    }
}

/// The table of sockets the transport still considers open.
pub struct TransportSockets {
    next_id: AtomicU64,
    sockets: Mutex<HashMap<ConnectionId, SocketHandle>>,
    auto_response: Option<AutoResponse>,
    max_idle: Option<Duration>,
}

impl TransportSockets {
    pub fn new(auto_response: Option<AutoResponse>, max_idle: Option<Duration>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sockets: Mutex::new(HashMap::new()),
            auto_response,
            max_idle,
        }
    }

    fn sockets(&self) -> MutexGuard<'_, HashMap<ConnectionId, SocketHandle>> {
        self.sockets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept a new socket. Returns its handle and the writer-side receiver.
    pub fn open(&self, capacity: usize) -> (SocketHandle, mpsc::Receiver<Frame>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = SocketHandle::new(id, tx);
        self.sockets().insert(id, handle.clone());
        (handle, rx)
    }

    /// Forget a socket once its task has finished.
    pub fn release(&self, id: ConnectionId) {
        if let Some(handle) = self.sockets().remove(&id) {
            handle.mark_closed();
        }
    }

    /// Every socket not yet closing, ordered by id.
    pub fn open_sockets(&self) -> Vec<SocketHandle> {
        let mut open: Vec<SocketHandle> = self
            .sockets()
            .values()
            .filter(|s| s.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|s| s.id());
        open
    }

    pub fn len(&self) -> usize {
        self.sockets().len()
    }

    pub fn auto_response(&self) -> Option<&AutoResponse> {
        self.auto_response.as_ref()
    }

    pub fn max_idle(&self) -> Option<Duration> {
        self.max_idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> TransportSockets {
        TransportSockets::new(None, None)
    }

    #[tokio::test]
    async fn test_open_assigns_unique_ids() {
        let t = transport();
        let (a, _rx_a) = t.open(4);
        let (b, _rx_b) = t.open(4);
        assert_ne!(a.id(), b.id());
        assert_eq!(t.len(), 2);
        assert_eq!(a.phase(), ConnectionPhase::Connecting);
    }

    #[tokio::test]
    async fn test_send_reaches_receiver() {
        let t = transport();
        let (handle, mut rx) = t.open(4);
        handle.send(Arc::from("hello")).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_send_full_and_closed() {
        let t = transport();
        let (handle, rx) = t.open(1);
        handle.send(Arc::from("a")).unwrap();
        assert_eq!(handle.send(Arc::from("b")), Err(SendError::Full));

        drop(rx);
        assert_eq!(handle.send(Arc::from("c")), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_close_first_reason_wins() {
        let t = transport();
        let (handle, _rx) = t.open(4);
        handle.activate();
        handle.close(CloseReason::SendFailure);
        handle.close(CloseReason::IdleTimeout);
        assert_eq!(handle.phase(), ConnectionPhase::Closing);
        assert_eq!(handle.close_reason(), Some(CloseReason::SendFailure));
        // closed() resolves immediately once cancelled
        handle.closed().await;
        assert_eq!(handle.send(Arc::from("x")), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_activate_does_not_reopen() {
        let t = transport();
        let (handle, _rx) = t.open(4);
        handle.close(CloseReason::ClientClose);
        handle.activate();
        assert_eq!(handle.phase(), ConnectionPhase::Closing);
    }

    #[tokio::test]
    async fn test_attachment_travels_with_handle() {
        let t = transport();
        let (handle, _rx) = t.open(4);
        assert!(handle.deserialize_attachment::<Vec<String>>().is_none());

        handle
            .serialize_attachment(&vec!["global".to_string()])
            .unwrap();

        // Any clone of the handle (e.g. from open_sockets) sees the same data
        let listed = t.open_sockets();
        let restored: Vec<String> = listed[0].deserialize_attachment().unwrap().unwrap();
        assert_eq!(restored, vec!["global".to_string()]);
    }

    #[tokio::test]
    async fn test_open_sockets_excludes_closing_and_released() {
        let t = transport();
        let (a, _rx_a) = t.open(4);
        let (b, _rx_b) = t.open(4);
        let (c, _rx_c) = t.open(4);
        b.close(CloseReason::IdleTimeout);
        t.release(c.id());

        let open: Vec<ConnectionId> = t.open_sockets().iter().map(|s| s.id()).collect();
        assert_eq!(open, vec![a.id()]);
        assert_eq!(c.phase(), ConnectionPhase::Closed);
    }
}
