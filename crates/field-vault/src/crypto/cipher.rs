//! AES-256-GCM-SIV sealing and opening of individual string fields.
//!
//! Every seal draws a fresh 96-bit nonce from the OS CSPRNG, so identical
//! plaintexts produce unrelated tokens. The tenant id and derivation version
//! are bound into the associated data: a token can only be opened under the
//! key, tenant and version it was sealed for.
//!
//! **Do NOT derive nonces from the plaintext, a counter, or the clock.**
//! Concurrent sessions for one tenant share key bytes, and only random nonces
//! keep them from colliding.

use std::fmt;

use aes_gcm_siv::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::derivation::TenantKey;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Separator between the ciphertext and nonce parts of a token string.
pub const TOKEN_SEPARATOR: char = ':';

/// Label prefixed to the associated data of every sealed field.
const AAD_LABEL: &[u8] = b"field-vault/token";

/// The at-rest representation of one encrypted field.
///
/// The string form is `base64(ciphertext+tag):base64(nonce)`. The tenant id
/// and derivation version are not part of the string; the caller stores them
/// next to it and supplies them again to [`EncryptedToken::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedToken {
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Version of the tenant key the field was sealed under.
    pub derivation_version: u32,
    /// Tenant the field belongs to.
    pub tenant_id: String,
}

impl EncryptedToken {
    /// Encode this value to its canonical string representation.
    pub fn to_token_string(&self) -> String {
        format!(
            "{}{}{}",
            STANDARD.encode(&self.ciphertext),
            TOKEN_SEPARATOR,
            STANDARD.encode(self.nonce),
        )
    }

    /// Parse a token string, attaching the tenant and version the caller
    /// stored alongside it.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MalformedToken`] if the string is not
    /// `base64:base64`, the nonce is not [`NONCE_LEN`] bytes, or the
    /// ciphertext is shorter than an authentication tag.
    pub fn parse(
        text: &str,
        tenant_id: &str,
        derivation_version: u32,
    ) -> Result<Self, CipherError> {
        let (ciphertext_b64, nonce_b64) = text
            .split_once(TOKEN_SEPARATOR)
            .ok_or(CipherError::MalformedToken)?;

        let ciphertext = STANDARD
            .decode(ciphertext_b64)
            .map_err(|_| CipherError::MalformedToken)?;
        if ciphertext.len() < TAG_LEN {
            return Err(CipherError::MalformedToken);
        }

        let nonce_bytes = STANDARD
            .decode(nonce_b64)
            .map_err(|_| CipherError::MalformedToken)?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CipherError::MalformedToken)?;

        Ok(Self {
            ciphertext,
            nonce,
            derivation_version,
            tenant_id: tenant_id.to_owned(),
        })
    }
}

impl fmt::Display for EncryptedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token_string())
    }
}

/// Errors produced by the cipher layer.
///
/// Messages are fixed strings: nothing about the failing input is echoed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// The token string could not be parsed.
    #[error("malformed token")]
    MalformedToken,

    /// Authentication failed: wrong key, wrong tenant/version, or tampering.
    #[error("decryption failed")]
    DecryptionFailed,

    /// AES-GCM-SIV refused to seal (input beyond the AEAD length limits).
    #[error("aead seal failed")]
    SealFailed,
}

/// Encrypt `plaintext` under `key`.
///
/// A random 96-bit nonce is generated per call via the OS CSPRNG. The
/// plaintext is sealed byte-for-byte: no padding, no truncation.
///
/// # Errors
///
/// Returns [`CipherError::SealFailed`] on an internal AEAD error (unreachable
/// for field-sized inputs).
pub fn seal(key: &TenantKey, plaintext: &str) -> Result<EncryptedToken, CipherError> {
    let cipher = build_cipher(key)?;

    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let aad = associated_data(key.tenant_id(), key.version());
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext.as_bytes(),
                aad: &aad,
            },
        )
        .map_err(|_| CipherError::SealFailed)?;

    Ok(EncryptedToken {
        ciphertext,
        nonce: nonce_bytes,
        derivation_version: key.version(),
        tenant_id: key.tenant_id().to_owned(),
    })
}

/// Decrypt `token` under `key`.
///
/// # Errors
///
/// Returns [`CipherError::DecryptionFailed`] when authentication fails for any
/// reason, including a key for another tenant or version, and when the
/// authenticated bytes are not UTF-8.
pub fn open(key: &TenantKey, token: &EncryptedToken) -> Result<String, CipherError> {
    let cipher = build_cipher(key)?;
    let aad = associated_data(&token.tenant_id, token.derivation_version);
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&token.nonce),
            Payload {
                msg: &token.ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CipherError::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| CipherError::DecryptionFailed)
}

/// Parse `text` and decrypt it under `key`.
///
/// When parsing fails, a decoy decryption of the same length class is run
/// before returning, so a malformed token costs about as much as an
/// authentic-looking one that fails authentication.
///
/// # Errors
///
/// Returns [`CipherError::MalformedToken`] or [`CipherError::DecryptionFailed`].
pub fn open_text(key: &TenantKey, text: &str) -> Result<String, CipherError> {
    match EncryptedToken::parse(text, key.tenant_id(), key.version()) {
        Ok(token) => open(key, &token),
        Err(e) => {
            decoy_open(key, text.len());
            Err(e)
        }
    }
}

fn decoy_open(key: &TenantKey, text_len: usize) {
    // base64 expands by 4/3; approximate the ciphertext length the text implied.
    let len = (text_len * 3 / 4).max(TAG_LEN);
    let decoy = EncryptedToken {
        ciphertext: vec![0u8; len],
        nonce: [0u8; NONCE_LEN],
        derivation_version: key.version(),
        tenant_id: key.tenant_id().to_owned(),
    };
    let _ = open(key, &decoy);
}

fn associated_data(tenant_id: &str, version: u32) -> Vec<u8> {
    let tenant = tenant_id.as_bytes();
    let mut aad = Vec::with_capacity(AAD_LABEL.len() + 4 + tenant.len());
    aad.extend_from_slice(AAD_LABEL);
    aad.extend_from_slice(&version.to_be_bytes());
    aad.extend_from_slice(tenant);
    aad
}

fn build_cipher(key: &TenantKey) -> Result<Aes256GcmSiv, CipherError> {
    Aes256GcmSiv::new_from_slice(key.expose()).map_err(|_| CipherError::SealFailed)
}
