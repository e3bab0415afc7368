use chat_protocol::{error_codes, Envelope, ErrorPayload, EventKind};
use uuid::Uuid;

/// Handler-level error taxonomy.
///
/// Everything here is an operational error: it is reported to the
/// originating session (when one exists) as an `error` envelope and the hub
/// keeps running.  Fatal bootstrap failures bypass this type entirely and
/// exit the process.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("user is not a member of chat {0}")]
    NotAMember(Uuid),
    #[error("invalid event: {0}")]
    Validation(String),
    #[error("storage unavailable: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("session outbound queue full")]
    Backpressure,
    #[error("hub is shutting down")]
    ShuttingDown,
}

impl HubError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            HubError::Auth(_) => error_codes::AUTH_FAILED,
            HubError::NotAMember(_) => error_codes::NOT_A_MEMBER,
            HubError::Validation(_) => error_codes::VALIDATION,
            HubError::Storage(_) => error_codes::STORAGE_UNAVAILABLE,
            HubError::Backpressure | HubError::ShuttingDown => error_codes::INTERNAL_ERROR,
        }
    }

    /// The `error` envelope sent back to the originating session.
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            kind: EventKind::Error,
            room_id: None,
            sender: Uuid::nil(),
            payload: serde_json::to_value(ErrorPayload {
                code: self.wire_code().to_owned(),
                message: self.to_string(),
            })
            .unwrap_or_default(),
        }
    }
}
