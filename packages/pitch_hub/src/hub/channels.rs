//! Channel Subscription Index
//!
//! Bidirectional connection ↔ channel mapping. Both directions are updated
//! together so the reverse index for a channel always equals the set of
//! connections that list it.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::registry::Session;
use super::transport::ConnectionId;

pub const GLOBAL_CHANNEL: &str = "global";

/// Longest channel name a client may join.
pub const MAX_CHANNEL_LEN: usize = 128;

pub fn portal_channel(session: &Session) -> String {
    format!("portal:{}", session.portal_type)
}

pub fn user_channel(user_id: &str) -> String {
    format!("user:{}", user_id)
}

pub fn pitch_channel(pitch_id: &str) -> String {
    format!("pitch:{}", pitch_id)
}

/// Channels every connection joins at connect time.
pub fn default_channels_for(session: &Session) -> Vec<String> {
    vec![
        GLOBAL_CHANNEL.to_string(),
        portal_channel(session),
        user_channel(&session.user_id),
    ]
}

/// Whether `session` may explicitly join `channel`.
///
/// Reserved `user:` and `portal:` channels are only joinable for the
/// session's own user and portal.
pub fn may_join(session: &Session, channel: &str) -> bool {
    if channel.is_empty() || channel.len() > MAX_CHANNEL_LEN {
        return false;
    }
    if channel.starts_with("user:") {
        return channel == user_channel(&session.user_id);
    }
    if channel.starts_with("portal:") {
        return channel == portal_channel(session);
    }
    true
}

fn drop_reverse(
    by_channel: &mut HashMap<String, HashSet<ConnectionId>>,
    channel: &str,
    id: ConnectionId,
) {
    if let Some(members) = by_channel.get_mut(channel) {
        members.remove(&id);
        if members.is_empty() {
            by_channel.remove(channel);
        }
    }
}

#[derive(Default)]
pub struct ChannelSubscriptionIndex {
    by_connection: HashMap<ConnectionId, BTreeSet<String>>,
    by_channel: HashMap<String, HashSet<ConnectionId>>,
}

impl ChannelSubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `channels` to the connection. Returns the ones that were new.
    pub fn subscribe<I, S>(&mut self, id: ConnectionId, channels: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subs = self.by_connection.entry(id).or_default();
        let mut added = Vec::new();
        for channel in channels {
            let channel = channel.into();
            if subs.insert(channel.clone()) {
                self.by_channel
                    .entry(channel.clone())
                    .or_default()
                    .insert(id);
                added.push(channel);
            }
        }
        added
    }

    /// Remove `channels` from the connection. Returns the ones it had.
    pub fn unsubscribe<I, S>(&mut self, id: ConnectionId, channels: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(subs) = self.by_connection.get_mut(&id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for channel in channels {
            let channel = channel.as_ref();
            if subs.remove(channel) {
                drop_reverse(&mut self.by_channel, channel, id);
                removed.push(channel.to_string());
            }
        }
        if subs.is_empty() {
            self.by_connection.remove(&id);
        }
        removed
    }

    /// Purge a connection from every channel.
    pub fn remove_connection(&mut self, id: ConnectionId) {
        if let Some(subs) = self.by_connection.remove(&id) {
            for channel in subs {
                drop_reverse(&mut self.by_channel, &channel, id);
            }
        }
    }

    /// Subscribed connections, ascending.
    pub fn subscribers_of(&self, channel: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .by_channel
            .get(channel)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// The connection's channels in sorted order.
    pub fn channels_of(&self, id: ConnectionId) -> Vec<String> {
        self.by_connection
            .get(&id)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn is_subscribed(&self, id: ConnectionId, channel: &str) -> bool {
        self.by_connection
            .get(&id)
            .is_some_and(|subs| subs.contains(channel))
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.by_channel.len()
    }
}
