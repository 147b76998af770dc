//! Error types for noticeboard.

use serde_json::Value;
use thiserror::Error;

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;

/// Application error type.
///
/// Every variant carries owned strings so the error can be cloned and handed
/// to every waiter of a shared in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    // === Business / auth failures reported by the server ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // === Client-side rejection ===
    #[error("Validation error: {0}")]
    Validation(String),

    // === Session ===
    /// The credential could not be recovered; the user must log in again.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    // === Transport ===
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Push channel error: {0}")]
    Push(String),

    // === Local ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Map a non-success HTTP response to an error.
    ///
    /// The server's `message` (or `error`) field is used when present.
    #[must_use]
    pub fn from_response(status: u16, body: &Value) -> Self {
        let message = body
            .get("message")
            .or_else(|| body.get("error"))
            .and_then(Value::as_str)
            .map_or_else(|| format!("HTTP {status}"), String::from);

        match status {
            400 | 422 => Self::BadRequest(message),
            401 => Self::Unauthorized,
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            _ => Self::Server { status, message },
        }
    }

    /// Returns the HTTP status this error was mapped from, if any.
    #[must_use]
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(404),
            Self::Unauthorized => Some(401),
            Self::Forbidden(_) => Some(403),
            Self::BadRequest(_) => Some(400),
            Self::Conflict(_) => Some(409),
            Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the error code for display and logging.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SessionExpired(_) => "SESSION_EXPIRED",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Server { .. } => "SERVER_ERROR",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Push(_) => "PUSH_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the session is gone and the shell must return to login.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }

    /// Whether the request never produced a server answer.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

// === From implementations ===

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_response_uses_server_message() {
        let err = AppError::from_response(404, &json!({ "message": "Announcement not found" }));
        assert_eq!(err, AppError::NotFound("Announcement not found".to_string()));
        assert_eq!(err.status_code(), Some(404));
    }

    #[test]
    fn test_from_response_without_body() {
        let err = AppError::from_response(503, &Value::Null);
        assert_eq!(
            err,
            AppError::Server {
                status: 503,
                message: "HTTP 503".to_string()
            }
        );
        assert_eq!(err.error_code(), "SERVER_ERROR");
    }

    #[test]
    fn test_session_fatal() {
        assert!(AppError::SessionExpired("refresh rejected".to_string()).is_session_fatal());
        assert!(!AppError::Unauthorized.is_session_fatal());
        assert!(AppError::Network("timed out".to_string()).is_network());
    }
}
