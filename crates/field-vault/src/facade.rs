//! [`EncryptionFacade`]: the entry point for encrypting and decrypting fields.
//!
//! Every call acquires the caller's session for the tenant, spends one unit
//! of its rate budget per field, runs the cipher and folds any failure into
//! [`VaultError`]. A session found expired mid-call is renewed once without
//! the caller noticing. Rate-limit and secret failures are returned as-is
//! for the caller to retry.

use tracing::{debug, warn};

use crate::audit::AuditOperation;
use crate::crypto::{self, EncryptedToken};
use crate::derivation::{validate_tenant_id, StaleVersion};
use crate::error::VaultError;
use crate::session::{EncryptionSession, SessionContext, SessionInfo, SessionRegistry};

/// Field-level encryption for many tenants, backed by one registry.
#[derive(Clone)]
pub struct EncryptionFacade {
    registry: SessionRegistry,
}

impl EncryptionFacade {
    /// Create a facade over `registry`.
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// The registry sessions are drawn from.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Open a new execution context.
    pub fn open_context(&self) -> SessionContext {
        self.registry.open_context()
    }

    /// Version new tokens are sealed under.
    pub fn current_version(&self) -> u32 {
        self.registry.deriver().current_version()
    }

    /// Encrypt one field value for `tenant_id`.
    pub fn encrypt_field(
        &self,
        ctx: &mut SessionContext,
        tenant_id: &str,
        plaintext: &str,
    ) -> Result<EncryptedToken, VaultError> {
        let result = self.with_session(ctx, tenant_id, 1, |_, session| {
            Ok(crypto::seal(session.write_key()?, plaintext)?)
        });
        self.finish(tenant_id, AuditOperation::EncryptField, result)
    }

    /// Decrypt a token sealed under the current derivation version.
    ///
    /// Tokens do not record their version. Once [`rotate_to`](Self::rotate_to)
    /// has moved the current version on, older tokens fail here with
    /// [`VaultError::DecryptionFailed`]; store the `derivation_version`
    /// returned at encryption and pass it to
    /// [`decrypt_field_versioned`](Self::decrypt_field_versioned).
    pub fn decrypt_field(
        &self,
        ctx: &mut SessionContext,
        tenant_id: &str,
        token: &str,
    ) -> Result<String, VaultError> {
        self.decrypt_field_versioned(ctx, tenant_id, token, self.current_version())
    }

    /// Decrypt a token sealed under derivation `version`.
    ///
    /// Keys for earlier versions are derived on first use and kept in the
    /// session until it ends.
    pub fn decrypt_field_versioned(
        &self,
        ctx: &mut SessionContext,
        tenant_id: &str,
        token: &str,
        version: u32,
    ) -> Result<String, VaultError> {
        let result = self.with_session(ctx, tenant_id, 1, |registry, session| {
            open_with(registry, session, token, version)
        });
        self.finish(tenant_id, AuditOperation::DecryptField, result)
    }

    /// Encrypt a batch of named field values, all or nothing.
    ///
    /// The batch needs one unit of rate budget per field, reserved up front.
    /// Results come back in input order.
    pub fn encrypt_fields<I, K, V>(
        &self,
        ctx: &mut SessionContext,
        tenant_id: &str,
        fields: I,
    ) -> Result<Vec<(String, EncryptedToken)>, VaultError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let fields: Vec<(String, V)> = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let result = self.with_session(ctx, tenant_id, batch_cost(fields.len()), |_, session| {
            let key = session.write_key()?;
            fields
                .iter()
                .map(|(name, value)| -> Result<_, VaultError> {
                    Ok((name.clone(), crypto::seal(key, value.as_ref())?))
                })
                .collect::<Result<Vec<_>, _>>()
        });
        self.finish(tenant_id, AuditOperation::EncryptFields, result)
    }

    /// Decrypt a batch of named tokens sealed under the current version.
    ///
    /// As with [`decrypt_field`](Self::decrypt_field), tokens sealed before a
    /// rotation need [`decrypt_fields_versioned`](Self::decrypt_fields_versioned).
    pub fn decrypt_fields<I, K, V>(
        &self,
        ctx: &mut SessionContext,
        tenant_id: &str,
        fields: I,
    ) -> Result<Vec<(String, String)>, VaultError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        self.decrypt_fields_versioned(ctx, tenant_id, fields, self.current_version())
    }

    /// Decrypt a batch of named tokens sealed under `version`, all or nothing.
    pub fn decrypt_fields_versioned<I, K, V>(
        &self,
        ctx: &mut SessionContext,
        tenant_id: &str,
        fields: I,
        version: u32,
    ) -> Result<Vec<(String, String)>, VaultError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let fields: Vec<(String, V)> = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let result = self.with_session(
            ctx,
            tenant_id,
            batch_cost(fields.len()),
            |registry, session| {
                fields
                    .iter()
                    .map(|(name, token)| {
                        open_with(registry, session, token.as_ref(), version)
                            .map(|plaintext| (name.clone(), plaintext))
                    })
                    .collect::<Result<Vec<_>, _>>()
            },
        );
        self.finish(tenant_id, AuditOperation::DecryptFields, result)
    }

    /// Snapshot of `ctx`'s session for `tenant_id`, without side effects.
    pub fn session_info(&self, ctx: &SessionContext, tenant_id: &str) -> Option<SessionInfo> {
        self.registry.session_info(ctx, tenant_id)
    }

    /// Invalidate `tenant_id`'s sessions in every context, expiring the one
    /// held by `ctx` immediately.
    pub fn invalidate_session(
        &self,
        ctx: &mut SessionContext,
        tenant_id: &str,
    ) -> Result<u64, VaultError> {
        let result = validate_tenant_id(tenant_id)
            .map(|()| self.registry.invalidate_in(ctx, tenant_id))
            .map_err(VaultError::from);
        self.finish(tenant_id, AuditOperation::InvalidateSession, result)
    }

    /// Seal new tokens under derivation `version` from now on.
    ///
    /// Sessions keyed for the previous version are replaced on their next
    /// use. Returns the previous version.
    pub fn rotate_to(&self, version: u32) -> Result<u32, StaleVersion> {
        self.registry.deriver().rotate_to(version)
    }

    fn with_session<T, F>(
        &self,
        ctx: &mut SessionContext,
        tenant_id: &str,
        ops: u32,
        mut op: F,
    ) -> Result<T, VaultError>
    where
        F: FnMut(&SessionRegistry, &mut EncryptionSession) -> Result<T, VaultError>,
    {
        let registry = &self.registry;
        let mut renewed = false;
        loop {
            let now = registry.clock().now();
            let attempt = match registry.acquire_at(ctx, tenant_id, now) {
                Ok(session) => registry
                    .reserve(session, ops, now)
                    .and_then(|()| op(registry, session)),
                Err(e) => Err(e),
            };
            match attempt {
                Err(VaultError::SessionExpired) if !renewed => {
                    debug!(tenant_id, "session expired during operation, renewing");
                    renewed = true;
                }
                Err(VaultError::SessionExpired) => {
                    return Err(VaultError::Internal("session renewal failed".into()))
                }
                other => return other,
            }
        }
    }

    fn finish<T>(
        &self,
        tenant_id: &str,
        operation: AuditOperation,
        result: Result<T, VaultError>,
    ) -> Result<T, VaultError> {
        if let Err(e) = &result {
            warn!(
                tenant_id,
                operation = ?operation,
                code = e.kind().code(),
                "field operation failed"
            );
            self.registry.record_failure(tenant_id, operation, e);
        }
        result
    }
}

impl std::fmt::Debug for EncryptionFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionFacade")
            .field("current_version", &self.current_version())
            .field("open_contexts", &self.registry.open_contexts())
            .finish()
    }
}

fn batch_cost(fields: usize) -> u32 {
    u32::try_from(fields).unwrap_or(u32::MAX)
}

/// Open `token` with `session`'s key for `version`.
///
/// A version that cannot have sealed anything still reports a malformed
/// token as such, so callers see the same classification either way.
fn open_with(
    registry: &SessionRegistry,
    session: &mut EncryptionSession,
    token: &str,
    version: u32,
) -> Result<String, VaultError> {
    let tenant_id = session.tenant_id().to_owned();
    match registry.key_for(session, version) {
        Ok(key) => Ok(crypto::open_text(key, token)?),
        Err(VaultError::DecryptionFailed) => {
            EncryptedToken::parse(token, &tenant_id, version)?;
            Err(VaultError::DecryptionFailed)
        }
        Err(e) => Err(e),
    }
}
