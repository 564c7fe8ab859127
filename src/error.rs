//! # Error Handling
//!
//! Two error families live here:
//!
//! - **AppError**: errors returned by HTTP handlers, converted to JSON responses
//! - **BridgeError**: the failure taxonomy of a bridged call, classified by scope
//!
//! ## Error Scopes (BridgeError):
//! - **Frame-scoped**: `Decode`, `Encode`, `QueueFull`: the frame is dropped, the call goes on
//! - **Message-scoped**: `Protocol`: one inbound message is dropped
//! - **Leg-fatal**: `ConnectTimeout`, `AuthRejected`, `ConfigInvalid`, `Transport`,
//!   `ChannelClosed`: the session controller moves to `Closing`
//!
//! ## Key Rust Concepts:
//! - **thiserror**: derives `Display` and `std::error::Error` from attributes
//! - **ResponseError trait**: lets actix turn an `AppError` into an HTTP response
//! - **From trait**: enables `?` to convert foreign errors automatically

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Errors surfaced by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **ServiceUnavailable**: The bridge is at its session limit (503 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// No capacity for another bridged call
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
/// - ServiceUnavailable → 503 (Service Unavailable)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "Maximum concurrent sessions (10) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl AppError {
    /// Map each error to (HTTP status, machine-readable type, message).
    fn parts(&self) -> (actix_web::http::StatusCode, &'static str, String) {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg.clone())
            }
        }
    }
}

/// When you use `?` with an anyhow::Error, it becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Failures that can happen while bridging one call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// µ-law payload could not be decoded (frame-scoped)
    #[error("decode error: {0}")]
    Decode(String),

    /// PCM payload could not be encoded (frame-scoped)
    #[error("encode error: {0}")]
    Encode(String),

    /// The voice-AI handshake did not complete in time (session-fatal)
    #[error("voice-AI connection timed out after {0}ms")]
    ConnectTimeout(u64),

    /// The voice-AI service refused the credentials or configuration (session-fatal)
    #[error("voice-AI service rejected the connection with status {status}: {reason}")]
    AuthRejected { status: u16, reason: String },

    /// Required credentials or configuration id were missing (session-fatal, no network call)
    #[error("voice-AI configuration invalid: {0}")]
    ConfigInvalid(String),

    /// Any other WebSocket failure while opening the voice-AI leg (session-fatal)
    #[error("voice-AI transport error: {0}")]
    Transport(String),

    /// The leg was already closed when a send was attempted
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The outbound queue of a leg is full; only this frame is dropped
    #[error("outbound queue full, frame dropped")]
    QueueFull,

    /// Malformed inbound message on either leg (message-scoped)
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    /// Whether this error ends the leg it happened on.
    pub fn is_leg_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectTimeout(_)
                | BridgeError::AuthRejected { .. }
                | BridgeError::ConfigInvalid(_)
                | BridgeError::Transport(_)
                | BridgeError::ChannelClosed(_)
        )
    }

    /// Short machine-readable label, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Decode(_) => "decode_error",
            BridgeError::Encode(_) => "encode_error",
            BridgeError::ConnectTimeout(_) => "connect_timeout",
            BridgeError::AuthRejected { .. } => "auth_rejected",
            BridgeError::ConfigInvalid(_) => "config_invalid",
            BridgeError::Transport(_) => "transport_error",
            BridgeError::ChannelClosed(_) => "channel_closed",
            BridgeError::QueueFull => "queue_full",
            BridgeError::Protocol(_) => "protocol_error",
        }
    }
}
