//! Root secret supply.
//!
//! The root secret is the single piece of input keying material from which
//! every tenant key is derived. This module only defines how it is obtained:
//! nothing here caches it, and the derivation layer drops it as soon as a key
//! has been expanded.
//!
//! # Security invariants
//!
//! - [`RootSecret`] zeroizes its buffer on drop and never prints its bytes.
//! - Sources must not log the secret value, only where it was looked up.

mod sources;

pub use sources::{EnvSecretSource, FileSecretSource, StaticSecretSource};

use std::{fmt, time::Duration};

use thiserror::Error;
use zeroize::Zeroizing;

/// Minimum accepted root secret length in bytes.
pub const MIN_ROOT_SECRET_LEN: usize = 16;

/// Opaque root secret bytes, zeroized on drop.
#[derive(Clone)]
pub struct RootSecret(Zeroizing<Vec<u8>>);

impl RootSecret {
    /// Wrap raw secret bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Borrow the secret bytes for the duration of a derivation.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Length of the secret in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the secret holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for RootSecret {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootSecret([REDACTED])")
    }
}

/// Errors produced while fetching the root secret.
#[derive(Debug, Error)]
pub enum SecretSourceError {
    /// The secret does not exist at the configured location.
    #[error("secret not found: {0}")]
    NotFound(String),

    /// The source refused access to the secret.
    #[error("access to secret denied: {0}")]
    Denied(String),

    /// The secret exists but cannot be used as key material.
    #[error("secret is malformed: {0}")]
    Malformed(String),

    /// The source did not answer within the configured timeout.
    #[error("secret source timed out after {0:?}")]
    Timeout(Duration),

    /// Too many fetches are already queued on the secret worker.
    #[error("secret source busy: {0} fetches pending")]
    Busy(usize),

    /// The fetch ended without producing a result.
    #[error("secret fetch aborted")]
    Aborted,

    /// Reading the secret failed at the I/O layer.
    #[error("secret source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supplier of the root secret.
///
/// Implementations may block (file reads, remote stores); the derivation
/// layer bounds every call with a timeout.
#[cfg_attr(test, mockall::automock)]
pub trait SecretSource: Send + Sync {
    /// Fetch the current root secret.
    fn fetch(&self) -> Result<RootSecret, SecretSourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_secret_redacted_in_debug() {
        let secret = RootSecret::new(b"super-secret-root-material".to_vec());
        let printed = format!("{secret:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("super"));
    }

    #[test]
    fn root_secret_exposes_bytes() {
        let secret = RootSecret::from(vec![7u8; 32]);
        assert_eq!(secret.len(), 32);
        assert!(!secret.is_empty());
        assert_eq!(secret.expose(), &[7u8; 32][..]);
    }

    #[test]
    fn mock_source_returns_configured_secret() {
        let mut source = MockSecretSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|| Ok(RootSecret::new(vec![1u8; 32])));
        assert_eq!(source.fetch().unwrap().len(), 32);
    }
}
