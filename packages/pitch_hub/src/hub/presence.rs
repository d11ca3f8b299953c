//! Presence Tracker
//!
//! Derives online/away/offline per user from live connection counts, with
//! explicit client overrides. Emits one change per transition.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::protocol::{PresenceStatus, ServerMessage, now_millis};

/// A single presence transition to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: String,
    pub status: PresenceStatus,
    pub timestamp: i64,
}

impl PresenceChange {
    fn new(user_id: &str, status: PresenceStatus) -> Self {
        Self {
            user_id: user_id.to_string(),
            status,
            timestamp: now_millis(),
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::UserPresence {
            user_id: self.user_id.clone(),
            status: self.status,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceCounts {
    pub online: u64,
    pub away: u64,
}

/// Users absent from the map are offline.
#[derive(Default)]
pub struct PresenceTracker {
    statuses: HashMap<String, PresenceStatus>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, user_id: &str) -> PresenceStatus {
        self.statuses
            .get(user_id)
            .copied()
            .unwrap_or(PresenceStatus::Offline)
    }

    /// A connection was registered. Only the user's first connection is a
    /// transition; later ones leave an explicit override untouched.
    pub fn connected(&mut self, user_id: &str, first_connection: bool) -> Option<PresenceChange> {
        if !first_connection {
            return None;
        }
        self.set_status(user_id, PresenceStatus::Online)
    }

    /// The user's last connection went away.
    pub fn disconnected(&mut self, user_id: &str) -> Option<PresenceChange> {
        self.set_status(user_id, PresenceStatus::Offline)
    }

    /// Set the state directly. `None` when nothing changed.
    pub fn set_status(&mut self, user_id: &str, status: PresenceStatus) -> Option<PresenceChange> {
        if self.status_of(user_id) == status {
            return None;
        }
        match status {
            PresenceStatus::Offline => {
                self.statuses.remove(user_id);
            }
            other => {
                self.statuses.insert(user_id.to_string(), other);
            }
        }
        Some(PresenceChange::new(user_id, status))
    }

    /// Reinstate a status without emitting anything (used on resume).
    pub fn restore(&mut self, user_id: &str, status: PresenceStatus) {
        match status {
            PresenceStatus::Offline => {
                self.statuses.remove(user_id);
            }
            other => {
                self.statuses.insert(user_id.to_string(), other);
            }
        }
    }

    pub fn counts(&self) -> PresenceCounts {
        let mut counts = PresenceCounts::default();
        for status in self.statuses.values() {
            match status {
                PresenceStatus::Online => counts.online += 1,
                PresenceStatus::Away => counts.away += 1,
                PresenceStatus::Offline => {}
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_connection_goes_online_once() {
        let mut p = PresenceTracker::new();
        let change = p.connected("u1", true).unwrap();
        assert_eq!(change.status, PresenceStatus::Online);
        assert!(p.connected("u1", false).is_none());
        assert_eq!(p.status_of("u1"), PresenceStatus::Online);
    }

    #[test]
    fn test_n_connections_emit_single_offline() {
        let mut p = PresenceTracker::new();
        let mut events = Vec::new();
        events.extend(p.connected("u1", true));
        for _ in 0..4 {
            events.extend(p.connected("u1", false));
        }
        // Only the registry knows when the last one closes; it calls disconnected once
        events.extend(p.disconnected("u1"));

        let offline: Vec<_> = events
            .iter()
            .filter(|c| c.status == PresenceStatus::Offline)
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(offline.len(), 1);
        assert_eq!(p.status_of("u1"), PresenceStatus::Offline);
    }

    #[test]
    fn test_away_survives_additional_connection() {
        let mut p = PresenceTracker::new();
        p.connected("u1", true);
        assert!(p.set_status("u1", PresenceStatus::Away).is_some());
        assert!(p.connected("u1", false).is_none());
        assert_eq!(p.status_of("u1"), PresenceStatus::Away);
    }

    #[test]
    fn test_reconnect_after_offline_is_online() {
        let mut p = PresenceTracker::new();
        p.connected("u1", true);
        p.set_status("u1", PresenceStatus::Away);
        p.disconnected("u1");
        let change = p.connected("u1", true).unwrap();
        assert_eq!(change.status, PresenceStatus::Online);
    }

    #[test]
    fn test_set_same_status_is_not_a_transition() {
        let mut p = PresenceTracker::new();
        assert!(p.set_status("u1", PresenceStatus::Offline).is_none());
        p.set_status("u1", PresenceStatus::Away);
        assert!(p.set_status("u1", PresenceStatus::Away).is_none());
    }

    #[test]
    fn test_counts_and_restore() {
        let mut p = PresenceTracker::new();
        p.restore("a", PresenceStatus::Online);
        p.restore("b", PresenceStatus::Away);
        p.restore("c", PresenceStatus::Online);
        p.restore("c", PresenceStatus::Offline);
        assert_eq!(p.counts(), PresenceCounts { online: 1, away: 1 });
    }

    #[test]
    fn test_change_to_message() {
        let mut p = PresenceTracker::new();
        let change = p.connected("u9", true).unwrap();
        match change.to_message() {
            ServerMessage::UserPresence {
                user_id, status, ..
            } => {
                assert_eq!(user_id, "u9");
                assert_eq!(status, PresenceStatus::Online);
            }
            other => panic!("Expected UserPresence, got {:?}", other),
        }
    }
}
