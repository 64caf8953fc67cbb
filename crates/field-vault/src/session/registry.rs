//! [`SessionRegistry`]: hands out sessions per (tenant, execution context).
//!
//! An execution context is an explicit [`SessionContext`] value. It owns its
//! sessions outright, so two contexts never share a session, a key, or a
//! rate-limit counter, and `&mut` access rules out concurrent mutation of one
//! session by construction.
//!
//! The only state shared between contexts is the per-tenant invalidation
//! generation, behind a mutex that is held for a map lookup at acquire time
//! and a map update at invalidate time.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Clock, EncryptionSession, SessionInfo, SessionPolicy, SessionState};
use crate::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use crate::derivation::{validate_tenant_id, KeyDerivationService, TenantKey};
use crate::error::VaultError;

/// Shared, cheaply cloneable session registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    deriver: KeyDerivationService,
    policy: SessionPolicy,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    generations: Mutex<HashMap<String, u64>>,
    open_contexts: AtomicUsize,
}

/// One execution context's sessions, at most one per tenant.
///
/// Dropping the context expires every session it holds and releases their
/// key material, whether the owner finished normally, returned an error,
/// unwound from a panic, or abandoned a future holding it.
pub struct SessionContext {
    id: Uuid,
    sessions: HashMap<String, EncryptionSession>,
    registry: SessionRegistry,
}

impl SessionContext {
    /// Unique id of this context.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of sessions held, in any state.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if the context holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns `true` if no held session could serve another operation at
    /// `now`: every one is terminal or past its lifetime.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.sessions
            .values()
            .all(|s| s.state().is_terminal() || now > s.expires_at())
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        let now = self.registry.inner.clock.now();
        for (_, mut session) in self.sessions.drain() {
            self.registry.expire(&mut session, "context released", now);
        }
        self.registry.inner.open_contexts.fetch_sub(1, Ordering::AcqRel);
        debug!(context_id = %self.id, "session context closed");
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl SessionRegistry {
    /// Create a registry deriving keys with `deriver` and applying `policy`
    /// to every new session.
    pub fn new(
        deriver: KeyDerivationService,
        policy: SessionPolicy,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                deriver,
                policy,
                clock,
                audit,
                generations: Mutex::new(HashMap::new()),
                open_contexts: AtomicUsize::new(0),
            }),
        }
    }

    /// Open a fresh execution context.
    pub fn open_context(&self) -> SessionContext {
        self.inner.open_contexts.fetch_add(1, Ordering::AcqRel);
        let ctx = SessionContext {
            id: Uuid::new_v4(),
            sessions: HashMap::new(),
            registry: self.clone(),
        };
        debug!(context_id = %ctx.id, "session context opened");
        ctx
    }

    /// Number of contexts currently alive.
    pub fn open_contexts(&self) -> usize {
        self.inner.open_contexts.load(Ordering::Acquire)
    }

    /// The derivation service backing new sessions.
    pub fn deriver(&self) -> &KeyDerivationService {
        &self.inner.deriver
    }

    /// Policy applied to new sessions.
    pub fn policy(&self) -> &SessionPolicy {
        &self.inner.policy
    }

    /// Clock used for lifetimes and rate windows.
    pub fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }

    /// Return `ctx`'s usable session for `tenant_id`, creating and keying a
    /// new one when there is none or the previous one is terminal, expired,
    /// invalidated, or bound to a superseded write version.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidTenant`] for an invalid tenant id.
    /// - [`VaultError::SecretUnavailable`] if a new session cannot derive its key.
    /// - [`VaultError::RateLimitExceeded`] if the session is still rate-limited.
    pub fn acquire<'c>(
        &self,
        ctx: &'c mut SessionContext,
        tenant_id: &str,
    ) -> Result<&'c mut EncryptionSession, VaultError> {
        let now = self.inner.clock.now();
        self.acquire_at(ctx, tenant_id, now)
    }

    pub(crate) fn acquire_at<'c>(
        &self,
        ctx: &'c mut SessionContext,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<&'c mut EncryptionSession, VaultError> {
        validate_tenant_id(tenant_id)?;
        let generation = self.generation(tenant_id);
        let write_version = self.inner.deriver.current_version();

        if let Some(session) = ctx.sessions.get_mut(tenant_id) {
            let before = session.state();
            session.refresh(now);
            self.observe(session, before, "lifetime or rate window elapsed", now);

            if !session.state().is_terminal() {
                if session.generation() < generation {
                    self.expire(session, "invalidated", now);
                } else if session.write_version() != write_version {
                    self.expire(session, "derivation version rotated", now);
                }
            }
        }

        let needs_new = ctx
            .sessions
            .get(tenant_id)
            .map_or(true, |s| s.state().is_terminal());
        if needs_new {
            let session = self.start_session(tenant_id, write_version, generation, now);
            ctx.sessions.insert(tenant_id.to_owned(), session);
        }

        let session = ctx
            .sessions
            .get_mut(tenant_id)
            .ok_or(VaultError::SessionExpired)?;
        match session.state() {
            SessionState::Active => Ok(session),
            SessionState::RateLimited => Err(VaultError::RateLimitExceeded {
                retry_after: session.retry_after(now),
            }),
            SessionState::Error => Err(session
                .failure()
                .cloned()
                .unwrap_or_else(|| VaultError::Internal("session failed".into()))),
            SessionState::Pending | SessionState::Expired => Err(VaultError::SessionExpired),
        }
    }

    /// Expire and drop `ctx`'s session for `tenant_id`.
    ///
    /// Returns `true` if a session was held.
    pub fn release(&self, ctx: &mut SessionContext, tenant_id: &str) -> bool {
        match ctx.sessions.remove(tenant_id) {
            Some(mut session) => {
                self.expire(&mut session, "released", self.inner.clock.now());
                true
            }
            None => false,
        }
    }

    /// Invalidate every context's session for `tenant_id`.
    ///
    /// Sessions in other contexts expire the next time their owner touches
    /// them. Returns the tenant's new generation.
    pub fn invalidate(&self, tenant_id: &str) -> u64 {
        let generation = {
            let mut generations = self.inner.generations.lock();
            let entry = generations.entry(tenant_id.to_owned()).or_insert(0);
            *entry += 1;
            *entry
        };
        warn!(tenant_id, generation, "tenant sessions invalidated");
        generation
    }

    /// Invalidate `tenant_id` everywhere and expire `ctx`'s session now.
    pub fn invalidate_in(&self, ctx: &mut SessionContext, tenant_id: &str) -> u64 {
        let generation = self.invalidate(tenant_id);
        if let Some(session) = ctx.sessions.get_mut(tenant_id) {
            self.expire(session, "invalidated", self.inner.clock.now());
        }
        generation
    }

    /// Read-only view of `ctx`'s session for `tenant_id`.
    ///
    /// Reports the state the next acquire would observe (expired past its
    /// lifetime or after invalidation, active again after the rate window)
    /// without applying any transition.
    pub fn session_info(&self, ctx: &SessionContext, tenant_id: &str) -> Option<SessionInfo> {
        let session = ctx.sessions.get(tenant_id)?;
        let now = self.inner.clock.now();
        let mut state = session.state();
        if matches!(state, SessionState::Active | SessionState::RateLimited) {
            let stale = session.generation() < self.generation(tenant_id)
                || session.write_version() != self.inner.deriver.current_version();
            if stale || now > session.expires_at() {
                state = SessionState::Expired;
            } else if state == SessionState::RateLimited && session.retry_after(now).is_zero() {
                state = SessionState::Active;
            }
        }
        let mut info = session.info_as(state);
        if state == SessionState::Active && session.state() == SessionState::RateLimited {
            info.operation_count = 0;
        }
        Some(info)
    }

    /// Spend `ops` units of `session`'s budget, auditing any transition.
    pub(crate) fn reserve(
        &self,
        session: &mut EncryptionSession,
        ops: u32,
        now: DateTime<Utc>,
    ) -> Result<(), VaultError> {
        let before = session.state();
        let result = session.try_reserve(now, ops);
        let reason = match session.state() {
            SessionState::RateLimited => "operation budget exhausted",
            SessionState::Expired => "lifetime elapsed",
            _ => "rate window elapsed",
        };
        self.observe(session, before, reason, now);
        result
    }

    /// `session`'s key for `version`, deriving and caching it on first use.
    ///
    /// Versions newer than the current write version, and version 0, cannot
    /// have sealed anything; they fail as [`VaultError::DecryptionFailed`]
    /// without deriving.
    pub(crate) fn key_for<'s>(
        &self,
        session: &'s mut EncryptionSession,
        version: u32,
    ) -> Result<&'s TenantKey, VaultError> {
        if version == 0 || version > self.inner.deriver.current_version() {
            return Err(VaultError::DecryptionFailed);
        }
        if session.key(version).is_none() {
            let key = self.inner.deriver.derive(session.tenant_id(), version)?;
            debug!(
                tenant_id = session.tenant_id(),
                version, "derived key for earlier version"
            );
            session.install_key(key);
        }
        session.key(version).ok_or(VaultError::SessionExpired)
    }

    /// Emit the failure audit event for one failed facade call.
    pub(crate) fn record_failure(
        &self,
        tenant_id: &str,
        operation: AuditOperation,
        error: &VaultError,
    ) {
        let reason = match error {
            VaultError::SecretUnavailable(msg)
            | VaultError::InvalidTenant(msg)
            | VaultError::Internal(msg) => Some(msg.clone()),
            _ => None,
        };
        self.emit(AuditEvent {
            tenant_id: tenant_id.to_owned(),
            operation,
            outcome: AuditOutcome::Failed { kind: error.kind() },
            timestamp: self.inner.clock.now(),
            reason,
        });
    }

    fn start_session(
        &self,
        tenant_id: &str,
        write_version: u32,
        generation: u64,
        now: DateTime<Utc>,
    ) -> EncryptionSession {
        let mut session =
            EncryptionSession::new(tenant_id, write_version, generation, &self.inner.policy, now);
        self.transition(&session, None, "created", now);

        match self.inner.deriver.derive(tenant_id, write_version) {
            Ok(key) => {
                session.activate(key, now);
                self.transition(&session, Some(SessionState::Pending), "key derived", now);
            }
            Err(e) => {
                let error = VaultError::from(e);
                warn!(tenant_id, error = %error, "session key derivation failed");
                session.fail(error);
                self.transition(&session, Some(SessionState::Pending), "key derivation failed", now);
            }
        }
        session
    }

    fn expire(&self, session: &mut EncryptionSession, reason: &str, now: DateTime<Utc>) {
        let before = session.state();
        session.expire();
        self.observe(session, before, reason, now);
    }

    fn observe(
        &self,
        session: &EncryptionSession,
        before: SessionState,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        if session.state() != before {
            self.transition(session, Some(before), reason, now);
        }
    }

    fn transition(
        &self,
        session: &EncryptionSession,
        from: Option<SessionState>,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        debug!(
            tenant_id = session.tenant_id(),
            session_id = %session.id(),
            from = from.map(SessionState::as_str),
            to = session.state().as_str(),
            reason,
            "session transition"
        );
        self.emit(AuditEvent {
            tenant_id: session.tenant_id().to_owned(),
            operation: AuditOperation::Session,
            outcome: AuditOutcome::Transitioned {
                from,
                to: session.state(),
            },
            timestamp: now,
            reason: Some(reason.to_owned()),
        });
    }

    fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.inner.audit.record(&event) {
            warn!(error = %e, tenant_id = %event.tenant_id, "audit event dropped");
        }
    }

    fn generation(&self, tenant_id: &str) -> u64 {
        self.inner
            .generations
            .lock()
            .get(tenant_id)
            .copied()
            .unwrap_or(0)
    }
}
