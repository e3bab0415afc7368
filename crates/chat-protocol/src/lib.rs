// chat-protocol: wire envelope and payload types for the fanout hub.
//
// Every frame -- client <-> hub over the WebSocket, and instance <-> instance
// over the sync topic -- carries a JSON envelope with a top-level `type`
// field.  The payload is an opaque JSON value interpreted per kind, so
// adding a kind never breaks older readers.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Hard ceiling on a single wire frame.  Oversize frames are a protocol
/// violation and close the connection.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// The single pub/sub topic shared by every hub instance.
pub const SYNC_TOPIC: &str = "chat_sync";

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Closed enumeration of envelope kinds.
///
/// Kinds are data, not types: the hub dispatches on this tag and parses the
/// payload per kind.  Anything it does not recognize deserializes to
/// `Unknown` and is logged and dropped by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Typing,
    Status,
    Presence,
    ChatUpdate,
    Error,
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The wire frame.
///
/// ```json
/// { "type": "message", "room_id": "…", "sender": "…", "payload": { … } }
/// ```
///
/// `sender` is server-stamped: whatever a client puts there is overwritten
/// with the authenticated user id before the envelope reaches the hub, so
/// it may be omitted on the inbound path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    #[serde(default = "Uuid::nil")]
    pub sender: Uuid,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build an envelope from a typed payload.
    pub fn new<P: Serialize>(
        kind: EventKind,
        room_id: Option<Uuid>,
        sender: Uuid,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Envelope {
            kind,
            room_id,
            sender,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Interpret the opaque payload as the given kind-specific type.
    pub fn parse_payload<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ---------------------------------------------------------------------------
// Kind-specific payloads
// ---------------------------------------------------------------------------

/// Client -> hub `message` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub chat_id: Uuid,
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_from: Option<Uuid>,
    #[serde(default)]
    pub forwarded: bool,
}

fn default_content_type() -> String {
    "text".to_owned()
}

/// Hub -> client (and hub -> bus) `message` payload: the persisted message.
///
/// Carries the row id and `sent_at` so recipients can acknowledge status
/// transitions and order messages for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_from: Option<Uuid>,
    #[serde(default)]
    pub forwarded: bool,
    pub sent_at: DateTime<Utc>,
}

/// Ephemeral `typing` payload.  Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub is_typing: bool,
}

/// `status` payload.
///
/// With `message_id` set this is a single transition.  With `message_id`
/// absent and `chat_id` present it is the bulk "mark entire chat read"
/// form (only valid with `status = read`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<Uuid>,
}

/// `presence` payload.  Always server-computed; a client-sent presence
/// envelope is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: Uuid,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// `error` payload (hub -> client only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// One of the frozen codes in [`error_codes`].
    pub code: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Per-recipient delivery status
// ---------------------------------------------------------------------------

/// Per-recipient message status.  Transitions are monotone:
/// `sent < delivered < read`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Frozen error codes
// ---------------------------------------------------------------------------

/// Frozen wire error codes.
///
/// | Code                  | Connection   |
/// |-----------------------|--------------|
/// | AUTH_FAILED           | closed       |
/// | NOT_A_MEMBER          | kept open    |
/// | VALIDATION            | kept open    |
/// | OVERSIZE_FRAME        | closed       |
/// | STORAGE_UNAVAILABLE   | kept open    |
/// | INTERNAL_ERROR        | kept open    |
pub mod error_codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const NOT_A_MEMBER: &str = "NOT_A_MEMBER";
    pub const VALIDATION: &str = "VALIDATION";
    pub const OVERSIZE_FRAME: &str = "OVERSIZE_FRAME";
    pub const STORAGE_UNAVAILABLE: &str = "STORAGE_UNAVAILABLE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_type_as_tag() {
        let env = Envelope::new(
            EventKind::Typing,
            Some(Uuid::nil()),
            Uuid::nil(),
            &TypingPayload {
                chat_id: Uuid::nil(),
                user_id: Uuid::nil(),
                is_typing: true,
            },
        )
        .unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "typing");
        assert_eq!(json["payload"]["is_typing"], true);
    }

    #[test]
    fn inbound_envelope_may_omit_sender() {
        let env: Envelope = serde_json::from_str(
            r#"{"type":"message","payload":{"chat_id":"cccccccc-cccc-cccc-cccc-cccccccccccc","content":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, EventKind::Message);
        assert!(env.sender.is_nil());
        let payload: MessagePayload = env.parse_payload().unwrap();
        assert_eq!(payload.content, "hi");
        assert_eq!(payload.content_type, "text");
        assert!(!payload.forwarded);
    }

    #[test]
    fn unrecognized_kind_maps_to_unknown() {
        let env: Envelope = serde_json::from_str(
            r#"{"type":"reaction","sender":"11111111-1111-1111-1111-111111111111","payload":{}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, EventKind::Unknown);
    }

    #[test]
    fn message_event_round_trips() {
        let event = MessageEvent {
            message_id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            content: "hello".to_owned(),
            content_type: "text".to_owned(),
            reply_to: None,
            forward_from: None,
            forwarded: false,
            sent_at: Utc::now(),
        };
        let env = Envelope::new(
            EventKind::Message,
            Some(event.chat_id),
            event.sender_id,
            &event,
        )
        .unwrap();
        let text = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&text).unwrap();
        let back: MessageEvent = parsed.parse_payload().unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn status_payload_bulk_form_omits_message_id() {
        let payload: StatusPayload =
            serde_json::from_str(r#"{"status":"read","chat_id":"cccccccc-cccc-cccc-cccc-cccccccccccc"}"#)
                .unwrap();
        assert_eq!(payload.message_id, None);
        assert_eq!(payload.status, DeliveryStatus::Read);
        assert!(payload.chat_id.is_some());
    }

    #[test]
    fn delivery_status_is_totally_ordered() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
        assert_eq!(DeliveryStatus::parse("delivered"), Some(DeliveryStatus::Delivered));
        assert_eq!(DeliveryStatus::parse("bogus"), None);
    }
}
