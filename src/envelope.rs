//! Event envelopes for the websocket protocol.
//!
//! DESIGN
//! ======
//! - Inbound: `{"event": "...", ...fields}` deserialized into the closed
//!   `ClientEvent` sum type. The `event` field is the serde tag; payload
//!   fields are camelCase to match the browser clients. Anything that fails
//!   to parse is dropped by the router, never answered.
//! - Outbound: `ServerEvent` serializes as `{event, data}`, or
//!   `{event: "error", message}` for reported failures. Absent fields are
//!   skipped so the wire shape stays minimal.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// INBOUND
// =============================================================================

/// The closed set of events a client may send. Unknown event names and
/// malformed payloads fail deserialization as a whole.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event")]
pub enum ClientEvent {
    /// Bind a user identity to this connection. Must happen first.
    #[serde(rename = "authenticate")]
    Authenticate { token: Option<String> },
    /// Send a message to one user. Creates the room on first contact.
    #[serde(rename = "message", rename_all = "camelCase")]
    Message {
        receiver_id: Uuid,
        message: String,
        #[serde(default)]
        images: Vec<String>,
    },
    /// Full history with one user, oldest first. Marks received chats read.
    #[serde(rename = "fetchChats", rename_all = "camelCase")]
    FetchChats { receiver_id: Uuid },
    /// Profiles of everyone currently online.
    #[serde(rename = "onlineUsers")]
    OnlineUsers,
    /// Unread chats from one user, with a count. Read state untouched.
    #[serde(rename = "unReadMessages", rename_all = "camelCase")]
    UnReadMessages { receiver_id: Uuid },
    /// One `{user, lastMessage}` entry per conversation.
    #[serde(rename = "messageList")]
    MessageList,
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Outbound envelope. Every message the server emits is one of these.
#[derive(Debug, Clone, Serialize)]
pub struct ServerEvent {
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerEvent {
    /// Create a data-carrying event.
    #[must_use]
    pub fn new(event: &'static str, data: serde_json::Value) -> Self {
        Self { event, data: Some(data), message: None }
    }

    /// Create an error event with a client-facing message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self { event: "error", data: None, message: Some(message.into()) }
    }

    /// Presence transition, broadcast to every open connection.
    #[must_use]
    pub fn user_status(user_id: Uuid, is_online: bool) -> Self {
        Self::new("userStatus", serde_json::json!({ "userId": user_id, "isOnline": is_online }))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_authenticate() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"authenticate","token":"abc.def.ghi"}"#).unwrap();
        let ClientEvent::Authenticate { token } = event else {
            panic!("expected authenticate");
        };
        assert_eq!(token.as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn parse_authenticate_missing_token_is_none() {
        let event: ClientEvent = serde_json::from_str(r#"{"event":"authenticate"}"#).unwrap();
        let ClientEvent::Authenticate { token } = event else {
            panic!("expected authenticate");
        };
        assert!(token.is_none());
    }

    #[test]
    fn parse_message_defaults_images() {
        let receiver = Uuid::new_v4();
        let text = json!({ "event": "message", "receiverId": receiver, "message": "hi" }).to_string();
        let event: ClientEvent = serde_json::from_str(&text).unwrap();
        let ClientEvent::Message { receiver_id, message, images } = event else {
            panic!("expected message");
        };
        assert_eq!(receiver_id, receiver);
        assert_eq!(message, "hi");
        assert!(images.is_empty());
    }

    #[test]
    fn parse_message_with_images() {
        let text = json!({
            "event": "message",
            "receiverId": Uuid::new_v4(),
            "message": "look",
            "images": ["a.png", "b.png"],
        })
        .to_string();
        let event: ClientEvent = serde_json::from_str(&text).unwrap();
        let ClientEvent::Message { images, .. } = event else {
            panic!("expected message");
        };
        assert_eq!(images, vec!["a.png", "b.png"]);
    }

    #[test]
    fn parse_unit_events_tolerate_extra_fields() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"onlineUsers","ignored":true}"#).unwrap();
        assert!(matches!(event, ClientEvent::OnlineUsers));

        let event: ClientEvent = serde_json::from_str(r#"{"event":"messageList"}"#).unwrap();
        assert!(matches!(event, ClientEvent::MessageList));
    }

    #[test]
    fn parse_unread_messages() {
        let receiver = Uuid::new_v4();
        let text = json!({ "event": "unReadMessages", "receiverId": receiver }).to_string();
        let event: ClientEvent = serde_json::from_str(&text).unwrap();
        let ClientEvent::UnReadMessages { receiver_id } = event else {
            panic!("expected unReadMessages");
        };
        assert_eq!(receiver_id, receiver);
    }

    #[test]
    fn unknown_event_fails() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"project","x":1}"#).is_err());
    }

    #[test]
    fn missing_required_field_fails() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"message","message":"hi"}"#).is_err());
    }

    #[test]
    fn malformed_uuid_fails() {
        let text = r#"{"event":"fetchChats","receiverId":"not-a-uuid"}"#;
        assert!(serde_json::from_str::<ClientEvent>(text).is_err());
    }

    #[test]
    fn data_event_serializes_without_message_key() {
        let event = ServerEvent::new("fetchChats", json!([]));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value.get("event").and_then(|v| v.as_str()), Some("fetchChats"));
        assert_eq!(value.get("data"), Some(&json!([])));
        assert!(value.get("message").is_none());
    }

    #[test]
    fn error_event_serializes_without_data_key() {
        let event = ServerEvent::error("boom");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value.get("event").and_then(|v| v.as_str()), Some("error"));
        assert_eq!(value.get("message").and_then(|v| v.as_str()), Some("boom"));
        assert!(value.get("data").is_none());
    }

    #[test]
    fn user_status_shape() {
        let user_id = Uuid::new_v4();
        let event = ServerEvent::user_status(user_id, true);
        assert_eq!(event.event, "userStatus");
        let data = event.data.unwrap();
        assert_eq!(data.get("userId"), Some(&json!(user_id)));
        assert_eq!(data.get("isOnline"), Some(&json!(true)));
    }
}
