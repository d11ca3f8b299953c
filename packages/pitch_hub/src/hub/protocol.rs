//! Hub Protocol Types
//!
//! Message types for client-hub communication over the duplex connection.
//! Inbound frames are JSON objects tagged by `type`; outbound events use
//! dotted type names (`user.presence`, `connection.established`, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Which side of the marketplace a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortalType {
    Creator,
    Investor,
    Production,
}

impl PortalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortalType::Creator => "creator",
            PortalType::Investor => "investor",
            PortalType::Production => "production",
        }
    }
}

impl fmt::Display for PortalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "creator" => Ok(PortalType::Creator),
            "investor" => Ok(PortalType::Investor),
            "production" => Ok(PortalType::Production),
            other => Err(format!("unknown portal type: {}", other)),
        }
    }
}

/// Coarse per-user presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Messages sent FROM the client TO the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Join channels (idempotent)
    Subscribe { channels: Vec<String> },
    /// Leave channels (idempotent)
    Unsubscribe { channels: Vec<String> },
    /// Direct message to another user
    #[serde(rename_all = "camelCase")]
    Message {
        target_user_id: String,
        #[serde(default)]
        content: Value,
    },
    /// Typing indicator scoped to a pitch
    #[serde(rename_all = "camelCase")]
    Typing { pitch_id: String, is_typing: bool },
    /// Explicit presence override
    Presence { status: PresenceStatus },
    Ping,
}

/// Type tags the hub understands; anything else is forward-compatible noise.
const KNOWN_CLIENT_TYPES: &[&str] = &[
    "subscribe",
    "unsubscribe",
    "message",
    "typing",
    "presence",
    "ping",
];

/// Result of parsing one inbound text frame.
#[derive(Debug)]
pub enum Inbound {
    Message(ClientMessage),
    /// Well-formed JSON with a `type` this hub does not know.
    Unknown(String),
    Malformed,
}

/// Parse an inbound frame, separating unknown types from malformed input.
pub fn parse_client_message(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Inbound::Malformed,
    };
    let type_ = match value.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => return Inbound::Malformed,
    };
    if !KNOWN_CLIENT_TYPES.contains(&type_.as_str()) {
        return Inbound::Unknown(type_);
    }
    match serde_json::from_value::<ClientMessage>(value) {
        Ok(msg) => Inbound::Message(msg),
        Err(_) => Inbound::Malformed,
    }
}

/// Events sent FROM the hub TO clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection.established", rename_all = "camelCase")]
    ConnectionEstablished { session_id: String, timestamp: i64 },
    #[serde(rename = "subscribed")]
    Subscribed { channels: Vec<String> },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { channels: Vec<String> },
    #[serde(rename = "user.message")]
    UserMessage {
        from: String,
        data: Value,
        timestamp: i64,
    },
    #[serde(rename = "user.typing", rename_all = "camelCase")]
    UserTyping {
        user_id: String,
        pitch_id: String,
        is_typing: bool,
        timestamp: i64,
    },
    #[serde(rename = "user.presence", rename_all = "camelCase")]
    UserPresence {
        user_id: String,
        status: PresenceStatus,
        timestamp: i64,
    },
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// The wire `type` tag of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished { .. } => "connection.established",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::UserMessage { .. } => "user.message",
            ServerMessage::UserTyping { .. } => "user.typing",
            ServerMessage::UserPresence { .. } => "user.presence",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Milliseconds since the Unix epoch, the timestamp unit on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        let msg = parse_client_message(r#"{"type":"subscribe","channels":["pitch:42"]}"#);
        match msg {
            Inbound::Message(ClientMessage::Subscribe { channels }) => {
                assert_eq!(channels, vec!["pitch:42".to_string()]);
            }
            other => panic!("Expected Subscribe, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_message_camel_case() {
        let msg = parse_client_message(
            r#"{"type":"message","targetUserId":"u2","content":{"text":"hi"}}"#,
        );
        match msg {
            Inbound::Message(ClientMessage::Message {
                target_user_id,
                content,
            }) => {
                assert_eq!(target_user_id, "u2");
                assert_eq!(content["text"], "hi");
            }
            other => panic!("Expected Message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_typing_and_presence() {
        assert!(matches!(
            parse_client_message(r#"{"type":"typing","pitchId":"p1","isTyping":true}"#),
            Inbound::Message(ClientMessage::Typing { is_typing: true, .. })
        ));
        assert!(matches!(
            parse_client_message(r#"{"type":"presence","status":"away"}"#),
            Inbound::Message(ClientMessage::Presence {
                status: PresenceStatus::Away
            })
        ));
        assert!(matches!(
            parse_client_message(r#"{"type":"ping"}"#),
            Inbound::Message(ClientMessage::Ping)
        ));
    }

    #[test]
    fn test_parse_unknown_type_is_not_malformed() {
        match parse_client_message(r#"{"type":"reaction","emoji":"+1"}"#) {
            Inbound::Unknown(t) => assert_eq!(t, "reaction"),
            other => panic!("Expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(parse_client_message("not json"), Inbound::Malformed));
        assert!(matches!(parse_client_message(r#"{"channels":[]}"#), Inbound::Malformed));
        // Known type with the wrong shape
        assert!(matches!(
            parse_client_message(r#"{"type":"subscribe","channels":"global"}"#),
            Inbound::Malformed
        ));
        assert!(matches!(
            parse_client_message(r#"{"type":"presence","status":"busy"}"#),
            Inbound::Malformed
        ));
    }

    #[test]
    fn test_server_message_wire_names() {
        let json = serde_json::to_value(ServerMessage::ConnectionEstablished {
            session_id: "s1".into(),
            timestamp: 5,
        })
        .unwrap();
        assert_eq!(json["type"], "connection.established");
        assert_eq!(json["sessionId"], "s1");

        let json = serde_json::to_value(ServerMessage::UserTyping {
            user_id: "u1".into(),
            pitch_id: "p1".into(),
            is_typing: false,
            timestamp: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "user.typing");
        assert_eq!(json["pitchId"], "p1");
        assert_eq!(json["isTyping"], false);

        let json = serde_json::to_value(ServerMessage::UserPresence {
            user_id: "u1".into(),
            status: PresenceStatus::Offline,
            timestamp: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "user.presence");
        assert_eq!(json["status"], "offline");
    }

    #[test]
    fn test_event_type_matches_serialized_tag() {
        let msgs = vec![
            ServerMessage::Subscribed { channels: vec![] },
            ServerMessage::Unsubscribed { channels: vec![] },
            ServerMessage::Pong { timestamp: 0 },
            ServerMessage::Error {
                message: "x".into(),
            },
            ServerMessage::UserMessage {
                from: "a".into(),
                data: Value::Null,
                timestamp: 0,
            },
        ];
        for msg in msgs {
            let json = serde_json::to_value(&msg).unwrap();
            assert_eq!(json["type"], msg.event_type());
        }
    }

    #[test]
    fn test_portal_type_from_str() {
        assert_eq!("Investor".parse::<PortalType>(), Ok(PortalType::Investor));
        assert_eq!(" creator ".parse::<PortalType>(), Ok(PortalType::Creator));
        assert!("admin".parse::<PortalType>().is_err());
        assert_eq!(PortalType::Production.to_string(), "production");
    }
}
