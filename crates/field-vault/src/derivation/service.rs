//! [`KeyDerivationService`]: root secret fetch + HKDF expansion.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use super::fetcher::SecretFetcher;
use super::{expand, validate_tenant_id, DerivationError, TenantKey};
use crate::secret::{RootSecret, SecretSource, SecretSourceError, MIN_ROOT_SECRET_LEN};

/// Returned when a rotation would not move the write version forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("derivation version {requested} is not newer than current version {current}")]
pub struct StaleVersion {
    /// Version writes currently use.
    pub current: u32,
    /// Version the caller asked for.
    pub requested: u32,
}

/// Derives tenant keys from the root secret.
///
/// Clones share the current write version and the secret fetch worker, and
/// may derive concurrently.
#[derive(Clone)]
pub struct KeyDerivationService {
    fetcher: Arc<SecretFetcher>,
    fetch_timeout: Duration,
    current_version: Arc<AtomicU32>,
}

impl KeyDerivationService {
    /// Create a service reading from `source`, bounding each fetch by
    /// `fetch_timeout`, and writing under `version`.
    pub fn new(source: Arc<dyn SecretSource>, fetch_timeout: Duration, version: u32) -> Self {
        Self {
            fetcher: Arc::new(SecretFetcher::new(source)),
            fetch_timeout,
            current_version: Arc::new(AtomicU32::new(version)),
        }
    }

    /// Version new writes are derived under.
    pub fn current_version(&self) -> u32 {
        self.current_version.load(Ordering::Acquire)
    }

    /// Move new writes to `version`. Older versions stay derivable.
    ///
    /// Returns the previous write version.
    ///
    /// # Errors
    ///
    /// Returns [`StaleVersion`] unless `version` exceeds the current one.
    pub fn rotate_to(&self, version: u32) -> Result<u32, StaleVersion> {
        let previous = self
            .current_version
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (version > current).then_some(version)
            })
            .map_err(|current| StaleVersion {
                current,
                requested: version,
            })?;
        info!(previous, current = version, "derivation version rotated");
        Ok(previous)
    }

    /// Derive the key for `tenant_id` at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`DerivationError::InvalidTenant`] before touching the secret
    /// source if the id is invalid, and [`DerivationError::SecretUnavailable`]
    /// if the source fails, times out, or yields fewer than
    /// [`MIN_ROOT_SECRET_LEN`] bytes.
    pub fn derive(&self, tenant_id: &str, version: u32) -> Result<TenantKey, DerivationError> {
        validate_tenant_id(tenant_id)?;
        let root = self.fetch_root()?;
        let bytes = expand(root.expose(), tenant_id, version)?;
        drop(root);
        debug!(tenant_id, version, "tenant key derived");
        Ok(TenantKey::new(tenant_id, version, bytes))
    }

    /// Fetch the root secret once and discard it, to check the source is
    /// reachable.
    ///
    /// # Errors
    ///
    /// Returns [`DerivationError::SecretUnavailable`] as [`derive`](Self::derive) would.
    pub fn probe(&self) -> Result<(), DerivationError> {
        self.fetch_root().map(drop)
    }

    /// Fetches queued or running on the secret worker.
    pub fn pending_fetches(&self) -> usize {
        self.fetcher.pending()
    }

    /// Fetch the root secret through the shared worker, waiting at most
    /// `fetch_timeout`. A fetch that overruns keeps running on the worker;
    /// its result is dropped (and zeroized) whenever it arrives.
    fn fetch_root(&self) -> Result<RootSecret, DerivationError> {
        let secret = self.fetcher.fetch(self.fetch_timeout)?;

        if secret.len() < MIN_ROOT_SECRET_LEN {
            return Err(SecretSourceError::Malformed(format!(
                "root secret must be at least {MIN_ROOT_SECRET_LEN} bytes"
            ))
            .into());
        }
        Ok(secret)
    }
}

impl std::fmt::Debug for KeyDerivationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDerivationService")
            .field("fetch_timeout", &self.fetch_timeout)
            .field("current_version", &self.current_version())
            .finish_non_exhaustive()
    }
}
