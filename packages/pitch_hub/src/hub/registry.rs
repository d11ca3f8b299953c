//! Connection Registry
//!
//! Bookkeeping of live connections and the session each one belongs to,
//! indexed by user so targeted delivery can find every socket of a user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::HandshakeError;

use super::protocol::PortalType;
use super::transport::{ConnectionId, SocketHandle};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Server-side metadata bound to exactly one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub portal_type: PortalType,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub device_info: DeviceInfo,
}

impl Session {
    /// A fresh session; every reconnect gets a new session id.
    pub fn new(user_id: impl Into<String>, portal_type: PortalType, device_info: DeviceInfo) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            portal_type,
            connected_at: now,
            last_activity: now,
            device_info,
        }
    }
}

pub struct ConnectionEntry {
    pub socket: SocketHandle,
    pub session: Session,
}

/// Per-portal connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalCounts {
    pub creator: u64,
    pub investor: u64,
    pub production: u64,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
}

/// What `unregister` removed.
#[derive(Debug)]
pub struct Unregistered {
    pub session: Session,
    pub socket: SocketHandle,
    pub was_last_for_user: bool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a connection under its session's user.
    ///
    /// Returns `true` if this is the user's first live connection.
    pub fn register(
        &mut self,
        socket: SocketHandle,
        session: Session,
    ) -> Result<bool, HandshakeError> {
        if session.user_id.trim().is_empty() {
            return Err(HandshakeError::MissingUserId);
        }

        let id = socket.id();
        if let Some(previous) = self.connections.remove(&id) {
            // Re-registering a handle replaces its session
            self.detach_from_user(id, &previous.session.user_id);
        }

        let user_connections = self.by_user.entry(session.user_id.clone()).or_default();
        let first = user_connections.is_empty();
        user_connections.insert(id);
        self.connections
            .insert(id, ConnectionEntry { socket, session });
        Ok(first)
    }

    /// Remove a connection. `None` if it was never registered (idempotent).
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Unregistered> {
        let entry = self.connections.remove(&id)?;
        let was_last_for_user = self.detach_from_user(id, &entry.session.user_id);
        Some(Unregistered {
            session: entry.session,
            socket: entry.socket,
            was_last_for_user,
        })
    }

    fn detach_from_user(&mut self, id: ConnectionId, user_id: &str) -> bool {
        match self.by_user.get_mut(user_id) {
            Some(set) => {
                set.remove(&id);
                if set.is_empty() {
                    self.by_user.remove(user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    /// Ids of every live connection of `user_id`, ascending.
    pub fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .by_user
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionEntry> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionEntry> {
        self.connections.get_mut(&id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionId, &ConnectionEntry)> {
        self.connections.iter()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn unique_users(&self) -> usize {
        self.by_user.len()
    }

    pub fn portal_counts(&self) -> PortalCounts {
        let mut counts = PortalCounts::default();
        for entry in self.connections.values() {
            match entry.session.portal_type {
                PortalType::Creator => counts.creator += 1,
                PortalType::Investor => counts.investor += 1,
                PortalType::Production => counts.production += 1,
            }
        }
        counts
    }
}
