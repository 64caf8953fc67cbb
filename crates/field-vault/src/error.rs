//! Crate-level error type returned by the registry and the facade.

use std::time::Duration;

use common::{ErrorKind, ServiceError};
use thiserror::Error;

use crate::crypto::CipherError;
use crate::derivation::DerivationError;

/// Errors surfaced by field-encryption operations.
///
/// Each variant maps onto exactly one [`ErrorKind`]. Messages for the token
/// failures are fixed strings so that two failing tokens are
/// indistinguishable apart from their kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    /// The root secret could not be obtained.
    #[error("secret unavailable: {0}")]
    SecretUnavailable(String),

    /// The tenant id failed validation.
    #[error("invalid tenant: {0}")]
    InvalidTenant(String),

    /// The session's operation budget for the current window is spent.
    #[error("rate limit exceeded; retry in {}s", .retry_after.as_secs())]
    RateLimitExceeded {
        /// Time until the current rate window closes.
        retry_after: Duration,
    },

    /// The session lifetime elapsed. The facade recovers from this itself.
    #[error("encryption session expired")]
    SessionExpired,

    /// The token text could not be parsed.
    #[error("malformed token")]
    MalformedToken,

    /// The token failed authentication.
    #[error("decryption failed")]
    DecryptionFailed,

    /// An unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// The stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::SecretUnavailable(_) => ErrorKind::SecretUnavailable,
            VaultError::InvalidTenant(_) => ErrorKind::InvalidTenant,
            VaultError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            VaultError::SessionExpired => ErrorKind::SessionExpired,
            VaultError::MalformedToken => ErrorKind::MalformedToken,
            VaultError::DecryptionFailed => ErrorKind::DecryptionFailed,
            VaultError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<DerivationError> for VaultError {
    fn from(e: DerivationError) -> Self {
        match e {
            DerivationError::SecretUnavailable(source) => {
                VaultError::SecretUnavailable(source.to_string())
            }
            DerivationError::InvalidTenant(reason) => VaultError::InvalidTenant(reason.into()),
            DerivationError::KeyExpansion => VaultError::Internal("key expansion failed".into()),
        }
    }
}

impl From<CipherError> for VaultError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::MalformedToken => VaultError::MalformedToken,
            CipherError::DecryptionFailed => VaultError::DecryptionFailed,
            CipherError::SealFailed => VaultError::Internal("aead seal failed".into()),
        }
    }
}

impl From<VaultError> for ServiceError {
    fn from(e: VaultError) -> Self {
        ServiceError::Field {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SecretSourceError;

    #[test]
    fn derivation_errors_map_to_kinds() {
        let e: VaultError = DerivationError::InvalidTenant("tenant id must not be empty").into();
        assert_eq!(e.kind(), ErrorKind::InvalidTenant);

        let e: VaultError =
            DerivationError::SecretUnavailable(SecretSourceError::NotFound("ROOT".into())).into();
        assert_eq!(e.kind(), ErrorKind::SecretUnavailable);
        assert!(e.to_string().contains("ROOT"));
    }

    #[test]
    fn cipher_errors_map_to_kinds() {
        assert_eq!(VaultError::from(CipherError::MalformedToken).kind(), ErrorKind::MalformedToken);
        assert_eq!(
            VaultError::from(CipherError::DecryptionFailed).kind(),
            ErrorKind::DecryptionFailed
        );
        assert_eq!(VaultError::from(CipherError::SealFailed).kind(), ErrorKind::Internal);
    }

    #[test]
    fn token_failures_carry_no_detail() {
        assert_eq!(VaultError::MalformedToken.to_string(), "malformed token");
        assert_eq!(VaultError::DecryptionFailed.to_string(), "decryption failed");
    }

    #[test]
    fn rate_limit_message_includes_retry_hint() {
        let e = VaultError::RateLimitExceeded {
            retry_after: Duration::from_secs(12),
        };
        assert!(e.to_string().contains("12s"));
        let service: ServiceError = e.into();
        assert_eq!(service.http_status(), 429);
    }
}
