//! [`TenantKey`]: a derived, tenant-scoped field-encryption key.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::KEY_LEN;

type HmacSha256 = Hmac<Sha256>;

/// Label MACed under the key to produce its public identifier.
const KEY_ID_LABEL: &[u8] = b"field-vault/key-id";

/// Bytes of the HMAC output kept in the key identifier.
const KEY_ID_LEN: usize = 8;

/// A 256-bit tenant key plus the non-secret metadata it was derived for.
///
/// Not `Clone`: every session owns its own copy. The key bytes are
/// overwritten with zeroes on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TenantKey {
    bytes: [u8; KEY_LEN],
    #[zeroize(skip)]
    tenant_id: String,
    #[zeroize(skip)]
    version: u32,
    #[zeroize(skip)]
    key_id: String,
}

impl TenantKey {
    pub(crate) fn new(tenant_id: &str, version: u32, bytes: [u8; KEY_LEN]) -> Self {
        let key_id = fingerprint(&bytes);
        Self {
            bytes,
            tenant_id: tenant_id.to_owned(),
            version,
            key_id,
        }
    }

    /// Tenant this key was derived for.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Derivation version this key belongs to.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Non-secret identifier: hex of a truncated HMAC of a fixed label under
    /// the key. Equal identifiers mean equal key bytes.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantKey")
            .field("tenant_id", &self.tenant_id)
            .field("version", &self.version)
            .field("key_id", &self.key_id)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

fn fingerprint(bytes: &[u8; KEY_LEN]) -> String {
    match HmacSha256::new_from_slice(bytes) {
        Ok(mut mac) => {
            mac.update(KEY_ID_LABEL);
            hex::encode(&mac.finalize().into_bytes()[..KEY_ID_LEN])
        }
        // HMAC accepts keys of any length.
        Err(_) => String::new(),
    }
}
