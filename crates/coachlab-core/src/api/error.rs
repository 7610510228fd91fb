use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Error code the server puts in the envelope when the anti-forgery header
/// is missing or does not match its cookie.
pub(crate) const ANTI_FORGERY_ERROR_CODE: &str = "CSRF";

/// Machine-readable error classes, stable enough for callers to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SessionError,
    SessionExpired,
    ValidationFailed,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    ServerFault,
    NetworkUnavailable,
    Timeout,
    InvalidResponse,
    OperationInProgress,
    InvalidInput,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Session error: {0}")]
    Session(String),

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("{message}")]
    ValidationFailed {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error ({status}): {message}")]
    ServerFault { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Another session operation is already in progress")]
    OperationInProgress,

    #[error("{0}")]
    InvalidInput(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl ErrorBody {
    /// Parse the `{ "error": { ... } }` envelope, if the body has one.
    pub(crate) fn parse(body: &str) -> Option<Self> {
        serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .map(|e| e.error)
    }

    pub(crate) fn is_anti_forgery(&self) -> bool {
        self.code.as_deref() == Some(ANTI_FORGERY_ERROR_CODE)
    }
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Build the caller-facing error for a non-success response.
    ///
    /// The envelope's `message` wins over the raw body when present.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let envelope = ErrorBody::parse(body);
        let message = envelope
            .as_ref()
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| Self::truncate_body(body));

        match status.as_u16() {
            400 | 422 => ApiError::ValidationFailed {
                message,
                details: envelope.and_then(|e| e.details),
            },
            401 => ApiError::Unauthorized(message),
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerFault {
                status: status.as_u16(),
                message,
            },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// Map a transport failure onto the timeout / network classes.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else {
            ApiError::Network(err)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Session(_) => ErrorKind::SessionError,
            ApiError::SessionExpired => ErrorKind::SessionExpired,
            ApiError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            ApiError::Unauthorized(_) => ErrorKind::Unauthorized,
            ApiError::Forbidden(_) => ErrorKind::Forbidden,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::Conflict(_) => ErrorKind::Conflict,
            ApiError::RateLimited => ErrorKind::RateLimited,
            ApiError::ServerFault { .. } => ErrorKind::ServerFault,
            ApiError::Network(_) => ErrorKind::NetworkUnavailable,
            ApiError::Timeout => ErrorKind::Timeout,
            ApiError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            ApiError::OperationInProgress => ErrorKind::OperationInProgress,
            ApiError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// True when the UI must send the user back to a login view.
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::SessionExpired | ApiError::Session(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_message_preferred_over_body() {
        let body = r#"{"error":{"code":"VALIDATION","message":"Email is taken","details":{"field":"email"}}}"#;
        match ApiError::from_status(StatusCode::UNPROCESSABLE_ENTITY, body) {
            ApiError::ValidationFailed { message, details } => {
                assert_eq!(message, "Email is taken");
                assert_eq!(details.unwrap()["field"], "email");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ApiError::from_status(StatusCode::NOT_FOUND, "").kind(), ErrorKind::NotFound);
        assert_eq!(ApiError::from_status(StatusCode::CONFLICT, "").kind(), ErrorKind::Conflict);
        assert_eq!(ApiError::from_status(StatusCode::FORBIDDEN, "").kind(), ErrorKind::Forbidden);
        assert_eq!(ApiError::from_status(StatusCode::BAD_GATEWAY, "").kind(), ErrorKind::ServerFault);
        assert_eq!(ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, "").kind(), ErrorKind::RateLimited);
        assert_eq!(ApiError::from_status(StatusCode::IM_A_TEAPOT, "").kind(), ErrorKind::InvalidResponse);
    }

    #[test]
    fn test_server_fault_keeps_status() {
        match ApiError::from_status(StatusCode::SERVICE_UNAVAILABLE, "down") {
            ApiError::ServerFault { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_long_body_truncated() {
        let body = "x".repeat(2000);
        let msg = ApiError::from_status(StatusCode::NOT_FOUND, &body).to_string();
        assert!(msg.contains("truncated, 2000 total bytes"));
    }

    #[test]
    fn test_anti_forgery_code_detected() {
        let body = ErrorBody::parse(r#"{"error":{"code":"CSRF","message":"bad token"}}"#).unwrap();
        assert!(body.is_anti_forgery());
        let body = ErrorBody::parse(r#"{"error":{"code":"FORBIDDEN"}}"#).unwrap();
        assert!(!body.is_anti_forgery());
        assert!(ErrorBody::parse("not json").is_none());
    }
}
