//! Wire-level error taxonomy for the RPC and HTTP surfaces.
//!
//! Every error a handler can return to a caller is one of a small set of
//! machine-readable codes plus a human-readable message. Optional fields
//! carry retry hints and structured details.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Machine-readable error codes carried in RPC responses and HTTP error
/// bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Caller's account is not linked to a channel.
    NotLinked,
    /// Caller's device has not completed pairing.
    NotPaired,
    /// The agent runner did not answer in time.
    AgentTimeout,
    /// Malformed params, unknown id formats, missing required fields.
    InvalidRequest,
    /// Spawn failure, transport failure, or an unhandled internal error.
    Unavailable,
    /// Missing tenant context, cross-tenant access, or insufficient scope.
    Unauthorized,
    /// Unknown tenant, terminal, or job.
    NotFound,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotLinked => "NOT_LINKED",
            Self::NotPaired => "NOT_PAIRED",
            Self::AgentTimeout => "AGENT_TIMEOUT",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unavailable => "UNAVAILABLE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
        };
        f.write_str(s)
    }
}

/// The structured error shape returned to callers.
///
/// Handlers build these with the constructors below; the dispatcher
/// serializes them into the `error` field of a response frame, and the HTTP
/// layer into JSON bodies.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct GatewayError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Whether the caller may retry the same request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Suggested delay before retrying, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Structured details for programmatic consumers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl GatewayError {
    /// Build an error with just a code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: None,
            retry_after_ms: None,
            details: None,
        }
    }

    /// `INVALID_REQUEST` with a message.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// `UNAUTHORIZED` with a message.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// `NOT_FOUND` with a message.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// `UNAVAILABLE` with a message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    /// `AGENT_TIMEOUT` with a message. Marked retryable.
    #[must_use]
    pub fn agent_timeout(message: impl Into<String>) -> Self {
        Self {
            retryable: Some(true),
            ..Self::new(ErrorCode::AgentTimeout, message)
        }
    }

    /// A rate-limit denial. Always carries a retry-after hint.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after_ms: u64) -> Self {
        Self {
            retryable: Some(true),
            retry_after_ms: Some(retry_after_ms),
            ..Self::new(ErrorCode::InvalidRequest, message)
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Result alias for handler code.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::InvalidRequest).unwrap();
        assert_eq!(json, "\"INVALID_REQUEST\"");
        let json = serde_json::to_string(&ErrorCode::AgentTimeout).unwrap();
        assert_eq!(json, "\"AGENT_TIMEOUT\"");
    }

    #[test]
    fn display_matches_wire_form() {
        assert_eq!(ErrorCode::Unauthorized.to_string(), "UNAUTHORIZED");
        let err = GatewayError::not_found("no such terminal");
        assert_eq!(err.to_string(), "NOT_FOUND: no such terminal");
    }

    #[test]
    fn optional_fields_omitted() {
        let err = GatewayError::invalid_request("bad params");
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("retryable").is_none());
        assert!(json.get("retryAfterMs").is_none());
        assert!(json.get("details").is_none());
    }

    #[test]
    fn rate_limited_carries_retry_hint() {
        let err = GatewayError::rate_limited("rate limit exceeded", 30_000);
        assert_eq!(err.retry_after_ms, Some(30_000));
        assert_eq!(err.retryable, Some(true));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["retryAfterMs"], 30_000);
    }
}
