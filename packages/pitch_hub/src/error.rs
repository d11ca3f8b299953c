use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

// =============================================================================
// Handshake Errors
// =============================================================================

/// Why a websocket upgrade was refused. Always answered with 401.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("missing user id")]
    MissingUserId,
    #[error("missing portal type")]
    MissingPortalType,
    #[error("unknown portal type: {0}")]
    UnknownPortalType(String),
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

// =============================================================================
// Hub Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub actor is gone")]
    ActorGone,
    #[error("hub actor didn't respond")]
    NoResponse,
    #[error("connection rejected: {0}")]
    Rejected(#[from] HandshakeError),
    #[error("invalid message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = match &self {
            HubError::ActorGone | HubError::NoResponse => StatusCode::SERVICE_UNAVAILABLE,
            HubError::Rejected(_) => StatusCode::UNAUTHORIZED,
            HubError::Encode(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
