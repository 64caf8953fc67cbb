//! Tenant key derivation from the root secret.
//!
//! # Algorithm
//!
//! HKDF-SHA256 (RFC 5869) with the root secret as input keying material, a
//! fixed domain label as salt, and a length-prefixed `info` block:
//!
//! ```text
//! [purpose_len:u8][purpose][version:u32be][tenant_len:u16be][tenant]
//! ```
//!
//! The encoding is injective, so no two (tenant, version) pairs share an
//! `info` string, and HKDF's pseudorandomness makes the resulting keys
//! unlinkable: one tenant's key says nothing about another's or about the
//! root. Bumping the version opens an independent key space, which is how
//! rotation keeps old tokens readable.
//!
//! # Security invariants
//!
//! - The root secret is borrowed for one derivation and dropped (zeroized)
//!   before [`KeyDerivationService::derive`] returns.
//! - Derived keys are never logged or persisted.
//! - Secret fetches run on one worker thread; a hung source blocks that
//!   thread only, and at most [`MAX_PENDING_FETCHES`] requests queue behind it.

mod fetcher;
mod key;
mod service;

pub use fetcher::MAX_PENDING_FETCHES;
pub use key::TenantKey;
pub use service::{KeyDerivationService, StaleVersion};

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use crate::crypto::KEY_LEN;
use crate::secret::SecretSourceError;

/// Maximum tenant id length in bytes.
pub const MAX_TENANT_ID_LEN: usize = 255;

/// HKDF salt: separates this key hierarchy from any other use of the root.
const HKDF_SALT: &[u8] = b"field-vault/tenant-key/v1";

/// Purpose label encoded into every `info` block.
const KEY_PURPOSE: &[u8] = b"pii-field-encryption";

/// Errors produced by the derivation layer.
#[derive(Debug, Error)]
pub enum DerivationError {
    /// The root secret could not be obtained or is unusable.
    #[error("secret unavailable: {0}")]
    SecretUnavailable(#[from] SecretSourceError),

    /// The tenant id failed validation.
    #[error("invalid tenant id: {0}")]
    InvalidTenant(&'static str),

    /// HKDF refused to expand (unreachable for a 32-byte output).
    #[error("key expansion failed")]
    KeyExpansion,
}

/// Check that `tenant_id` can be used as a derivation context.
///
/// # Errors
///
/// Returns [`DerivationError::InvalidTenant`] if the id is empty or
/// whitespace-only, longer than [`MAX_TENANT_ID_LEN`] bytes, or contains
/// control characters.
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), DerivationError> {
    if tenant_id.trim().is_empty() {
        return Err(DerivationError::InvalidTenant("tenant id must not be empty"));
    }
    if tenant_id.len() > MAX_TENANT_ID_LEN {
        return Err(DerivationError::InvalidTenant(
            "tenant id exceeds 255 bytes",
        ));
    }
    if tenant_id.chars().any(char::is_control) {
        return Err(DerivationError::InvalidTenant(
            "tenant id contains control characters",
        ));
    }
    Ok(())
}

/// Expand `root` into the key bytes for (`tenant_id`, `version`).
///
/// Callers validate `tenant_id` first; its length must fit the u16 prefix.
pub(crate) fn expand(
    root: &[u8],
    tenant_id: &str,
    version: u32,
) -> Result<[u8; KEY_LEN], DerivationError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), root);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(&info(tenant_id, version), &mut okm)
        .map_err(|_| DerivationError::KeyExpansion)?;
    Ok(okm)
}

fn info(tenant_id: &str, version: u32) -> Vec<u8> {
    let tenant = tenant_id.as_bytes();
    let mut info = Vec::with_capacity(1 + KEY_PURPOSE.len() + 4 + 2 + tenant.len());
    info.push(KEY_PURPOSE.len() as u8);
    info.extend_from_slice(KEY_PURPOSE);
    info.extend_from_slice(&version.to_be_bytes());
    info.extend_from_slice(&(tenant.len() as u16).to_be_bytes());
    info.extend_from_slice(tenant);
    info
}
