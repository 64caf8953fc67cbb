//! Error taxonomy shared across crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds surfaced by the field-encryption facade.
///
/// Variants map to HTTP status codes returned to callers:
/// - [`ErrorKind::InvalidTenant`] → 400
/// - [`ErrorKind::MalformedToken`], [`ErrorKind::DecryptionFailed`] → 422
/// - [`ErrorKind::RateLimitExceeded`] → 429
/// - [`ErrorKind::SecretUnavailable`], [`ErrorKind::SessionExpired`] → 503
/// - [`ErrorKind::Internal`] → 500
///
/// `MalformedToken` and `DecryptionFailed` share a status code so that a
/// caller probing ciphertexts learns nothing beyond the kind itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The root secret could not be obtained (unreachable, denied, timed out).
    #[error("secret unavailable")]
    SecretUnavailable,

    /// The tenant identifier is empty, too long, or contains control characters.
    #[error("invalid tenant")]
    InvalidTenant,

    /// The session spent its operation budget for the current window.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// The session lifetime elapsed. Recovered internally; never expected
    /// on the wire.
    #[error("session expired")]
    SessionExpired,

    /// The token text could not be parsed.
    #[error("malformed token")]
    MalformedToken,

    /// The token failed authentication under the tenant key.
    #[error("decryption failed")]
    DecryptionFailed,

    /// An unexpected internal failure.
    #[serde(rename = "internal_error")]
    #[error("internal error")]
    Internal,
}

impl ErrorKind {
    /// Short machine-readable code, identical to the serde representation.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::SecretUnavailable => "secret_unavailable",
            ErrorKind::InvalidTenant => "invalid_tenant",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::MalformedToken => "malformed_token",
            ErrorKind::DecryptionFailed => "decryption_failed",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// Returns the HTTP status code that should be sent for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidTenant => 400,
            ErrorKind::MalformedToken | ErrorKind::DecryptionFailed => 422,
            ErrorKind::RateLimitExceeded => 429,
            ErrorKind::SecretUnavailable | ErrorKind::SessionExpired => 503,
            ErrorKind::Internal => 500,
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::SecretUnavailable | ErrorKind::RateLimitExceeded | ErrorKind::SessionExpired
        )
    }
}

/// Top-level HTTP service error type.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request body or headers could not be used.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The addressed resource (session, context) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A capacity limit was reached or a dependency is temporarily unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// A field-encryption operation failed with a stable [`ErrorKind`].
    #[error("{kind}: {message}")]
    Field {
        /// The stable error kind.
        kind: ErrorKind,
        /// Message safe to expose to callers.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Unavailable(_) => 503,
            ServiceError::Field { kind, .. } => kind.http_status(),
            ServiceError::Internal(_) => 500,
        }
    }

    /// Returns the machine-readable code placed in the error response body.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Unavailable(_) => "service_unavailable",
            ServiceError::Field { kind, .. } => kind.code(),
            ServiceError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_codes() {
        assert_eq!(ErrorKind::InvalidTenant.http_status(), 400);
        assert_eq!(ErrorKind::RateLimitExceeded.http_status(), 429);
        assert_eq!(ErrorKind::SecretUnavailable.http_status(), 503);
        assert_eq!(
            ErrorKind::MalformedToken.http_status(),
            ErrorKind::DecryptionFailed.http_status()
        );
        assert_eq!(ServiceError::BadRequest("x".into()).http_status(), 400);
        assert_eq!(ServiceError::NotFound("x".into()).http_status(), 404);
        assert_eq!(ServiceError::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn code_matches_serde_name() {
        for kind in [
            ErrorKind::SecretUnavailable,
            ErrorKind::InvalidTenant,
            ErrorKind::RateLimitExceeded,
            ErrorKind::SessionExpired,
            ErrorKind::MalformedToken,
            ErrorKind::DecryptionFailed,
            ErrorKind::Internal,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.code()));
        }
    }

    #[test]
    fn field_error_uses_kind_status() {
        let e = ServiceError::Field {
            kind: ErrorKind::RateLimitExceeded,
            message: "slow down".into(),
        };
        assert_eq!(e.http_status(), 429);
        assert_eq!(e.code(), "rate_limit_exceeded");
        assert!(e.to_string().contains("slow down"));
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::RateLimitExceeded.is_retryable());
        assert!(ErrorKind::SecretUnavailable.is_retryable());
        assert!(!ErrorKind::DecryptionFailed.is_retryable());
        assert!(!ErrorKind::InvalidTenant.is_retryable());
    }
}
