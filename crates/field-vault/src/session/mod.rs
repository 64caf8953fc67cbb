//! Bounded-lifetime, rate-limited encryption sessions.
//!
//! # State machine
//!
//! ```text
//! Pending ──derive ok──▶ Active ──budget spent──▶ RateLimited
//!    │                    ▲  │                         │
//!    │                    │  └──────window elapsed─────┘ (lazy)
//!    └─derive failed─▶ Error      │
//!                                 └─lifetime/invalidate/release─▶ Expired
//! ```
//!
//! `Expired` and `Error` are terminal. Transitions are evaluated lazily on
//! the next acquire or operation; nothing runs in the background. Expiry is
//! checked before the rate window, so a session that is both past its
//! lifetime and rate-limited is reported as expired.

pub mod clock;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::{SessionContext, SessionRegistry};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::derivation::TenantKey;
use crate::error::VaultError;

/// Lifecycle state of an [`EncryptionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created; key not yet derived.
    Pending,
    /// Key derived; within lifetime and rate budget.
    Active,
    /// Budget spent; refuses operations until the window resets.
    RateLimited,
    /// Terminal; key material released.
    Expired,
    /// Terminal; key derivation failed.
    Error,
}

impl SessionState {
    /// Returns `true` for `Expired` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Error)
    }

    /// Lower-case name, as used in audit events and the HTTP API.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::RateLimited => "rate_limited",
            SessionState::Expired => "expired",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifetime and rate-limit settings applied to every new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// How long a session may be used after creation.
    pub lifetime: Duration,
    /// Length of one rate-limit window.
    pub rate_window: Duration,
    /// Operations allowed per window.
    pub operation_limit: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            lifetime: Duration::minutes(15),
            rate_window: Duration::seconds(60),
            operation_limit: 1_000,
        }
    }
}

/// Read-only snapshot of a session, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Unique id of this session instance.
    pub session_id: Uuid,
    /// Tenant the session is bound to.
    pub tenant_id: String,
    /// Effective state at the time of the snapshot.
    pub state: SessionState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// End of the session lifetime.
    pub expires_at: DateTime<Utc>,
    /// Operations spent in the current window.
    pub operation_count: u32,
    /// Operations allowed per window.
    pub operation_limit: u32,
    /// Start of the current window.
    pub operation_window_start: DateTime<Utc>,
    /// Version new writes are sealed under.
    pub derivation_version: u32,
    /// Identifier of the write key, while one is held.
    pub key_id: Option<String>,
}

/// One tenant's unit of encryption work inside one execution context.
///
/// Owns its tenant keys exclusively: the write key plus any older versions
/// derived on demand for decryption. Expiring the session drops them, and
/// [`TenantKey`] zeroizes on drop.
pub struct EncryptionSession {
    id: Uuid,
    tenant_id: String,
    state: SessionState,
    keys: BTreeMap<u32, TenantKey>,
    write_version: u32,
    generation: u64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    operation_count: u32,
    operation_window_start: DateTime<Utc>,
    operation_limit: u32,
    rate_window: Duration,
    failure: Option<VaultError>,
}

impl EncryptionSession {
    pub(crate) fn new(
        tenant_id: &str,
        write_version: u32,
        generation: u64,
        policy: &SessionPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_owned(),
            state: SessionState::Pending,
            keys: BTreeMap::new(),
            write_version,
            generation,
            created_at: now,
            expires_at: now + policy.lifetime,
            operation_count: 0,
            operation_window_start: now,
            operation_limit: policy.operation_limit,
            rate_window: policy.rate_window,
            failure: None,
        }
    }

    /// Unique id of this session instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Tenant the session is bound to.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Current lifecycle state, as last evaluated.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Version new writes are sealed under.
    pub fn write_version(&self) -> u32 {
        self.write_version
    }

    /// Invalidation generation the session was created under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// End of the session lifetime.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Operations spent in the current window.
    pub fn operation_count(&self) -> u32 {
        self.operation_count
    }

    /// The error that moved the session to `Error`, if any.
    pub fn failure(&self) -> Option<&VaultError> {
        self.failure.as_ref()
    }

    /// `Pending → Active` with the freshly derived write key.
    pub(crate) fn activate(&mut self, key: TenantKey, now: DateTime<Utc>) {
        if self.state != SessionState::Pending {
            return;
        }
        self.keys.insert(key.version(), key);
        self.operation_window_start = now;
        self.state = SessionState::Active;
    }

    /// `Pending → Error`.
    pub(crate) fn fail(&mut self, error: VaultError) {
        if self.state != SessionState::Pending {
            return;
        }
        self.failure = Some(error);
        self.state = SessionState::Error;
    }

    /// Any non-terminal state → `Expired`, dropping all key material.
    pub(crate) fn expire(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.keys.clear();
        self.state = SessionState::Expired;
    }

    /// Apply the passive time-based transitions: lifetime expiry first, then
    /// rate window reset.
    pub(crate) fn refresh(&mut self, now: DateTime<Utc>) {
        if !matches!(self.state, SessionState::Active | SessionState::RateLimited) {
            return;
        }
        if now > self.expires_at {
            self.expire();
            return;
        }
        if now >= self.operation_window_start + self.rate_window {
            self.operation_count = 0;
            self.operation_window_start = now;
            self.state = SessionState::Active;
        }
    }

    /// Spend `ops` units of the window budget.
    ///
    /// A request larger than the remaining budget is refused whole and
    /// consumes nothing. The session only moves to `RateLimited` once the
    /// budget is fully spent.
    pub(crate) fn try_reserve(&mut self, now: DateTime<Utc>, ops: u32) -> Result<(), VaultError> {
        self.refresh(now);
        match self.state {
            SessionState::Active => {}
            SessionState::RateLimited => {
                return Err(VaultError::RateLimitExceeded {
                    retry_after: self.retry_after(now),
                })
            }
            _ => return Err(VaultError::SessionExpired),
        }

        let remaining = self.operation_limit.saturating_sub(self.operation_count);
        if ops > remaining {
            if remaining == 0 {
                self.state = SessionState::RateLimited;
            }
            return Err(VaultError::RateLimitExceeded {
                retry_after: self.retry_after(now),
            });
        }
        self.operation_count += ops;
        Ok(())
    }

    /// Time until the current rate window closes.
    pub fn retry_after(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.operation_window_start + self.rate_window - now)
            .to_std()
            .unwrap_or_default()
    }

    /// The key new writes are sealed with.
    pub(crate) fn write_key(&self) -> Result<&TenantKey, VaultError> {
        self.key(self.write_version).ok_or(VaultError::SessionExpired)
    }

    pub(crate) fn key(&self, version: u32) -> Option<&TenantKey> {
        self.keys.get(&version)
    }

    pub(crate) fn install_key(&mut self, key: TenantKey) {
        if matches!(self.state, SessionState::Active | SessionState::RateLimited) {
            self.keys.insert(key.version(), key);
        }
    }

    /// Snapshot with `state` overriding the stored state.
    pub(crate) fn info_as(&self, state: SessionState) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            tenant_id: self.tenant_id.clone(),
            state,
            created_at: self.created_at,
            expires_at: self.expires_at,
            operation_count: self.operation_count,
            operation_limit: self.operation_limit,
            operation_window_start: self.operation_window_start,
            derivation_version: self.write_version,
            key_id: match state {
                SessionState::Active | SessionState::RateLimited => {
                    self.key(self.write_version).map(|k| k.key_id().to_owned())
                }
                _ => None,
            },
        }
    }

    /// Snapshot of the session as last evaluated.
    pub fn info(&self) -> SessionInfo {
        self.info_as(self.state)
    }
}

impl fmt::Debug for EncryptionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionSession")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("state", &self.state)
            .field("write_version", &self.write_version)
            .field("keys_held", &self.keys.len())
            .field("operation_count", &self.operation_count)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;

    fn policy(limit: u32) -> SessionPolicy {
        SessionPolicy {
            lifetime: Duration::minutes(10),
            rate_window: Duration::seconds(60),
            operation_limit: limit,
        }
    }

    fn active_session(limit: u32, now: DateTime<Utc>) -> EncryptionSession {
        let mut s = EncryptionSession::new("acme", 1, 0, &policy(limit), now);
        s.activate(TenantKey::new("acme", 1, [7u8; KEY_LEN]), now);
        s
    }

    #[test]
    fn new_session_is_pending_without_keys() {
        let now = Utc::now();
        let s = EncryptionSession::new("acme", 1, 0, &policy(5), now);
        assert_eq!(s.state(), SessionState::Pending);
        assert!(s.write_key().is_err());
        assert_eq!(s.expires_at(), now + Duration::minutes(10));
    }

    #[test]
    fn activation_installs_write_key() {
        let s = active_session(5, Utc::now());
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.write_key().unwrap().version(), 1);
        assert!(s.info().key_id.is_some());
    }

    #[test]
    fn failure_is_terminal() {
        let mut s = EncryptionSession::new("acme", 1, 0, &policy(5), Utc::now());
        s.fail(VaultError::SecretUnavailable("down".into()));
        assert_eq!(s.state(), SessionState::Error);
        s.activate(TenantKey::new("acme", 1, [7u8; KEY_LEN]), Utc::now());
        assert_eq!(s.state(), SessionState::Error);
        s.expire();
        assert_eq!(s.state(), SessionState::Error);
        assert!(matches!(s.failure(), Some(VaultError::SecretUnavailable(_))));
    }

    #[test]
    fn budget_exhaustion_rate_limits_next_operation() {
        let now = Utc::now();
        let mut s = active_session(3, now);
        for _ in 0..3 {
            s.try_reserve(now, 1).unwrap();
        }
        assert_eq!(s.state(), SessionState::Active);
        let err = s.try_reserve(now, 1).unwrap_err();
        assert!(matches!(err, VaultError::RateLimitExceeded { .. }));
        assert_eq!(s.state(), SessionState::RateLimited);
    }

    #[test]
    fn window_reset_restores_budget_without_rekeying() {
        let now = Utc::now();
        let mut s = active_session(1, now);
        let key_id = s.write_key().unwrap().key_id().to_owned();
        s.try_reserve(now, 1).unwrap();
        assert!(s.try_reserve(now, 1).is_err());

        let later = now + Duration::seconds(60);
        s.try_reserve(later, 1).unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.operation_count(), 1);
        assert_eq!(s.write_key().unwrap().key_id(), key_id);
    }

    #[test]
    fn oversized_batch_is_refused_whole() {
        let now = Utc::now();
        let mut s = active_session(5, now);
        s.try_reserve(now, 3).unwrap();
        assert!(matches!(
            s.try_reserve(now, 3),
            Err(VaultError::RateLimitExceeded { .. })
        ));
        assert_eq!(s.operation_count(), 3);
        assert_eq!(s.state(), SessionState::Active);
        s.try_reserve(now, 2).unwrap();
    }

    #[test]
    fn lifetime_expiry_releases_keys() {
        let now = Utc::now();
        let mut s = active_session(5, now);
        let err = s.try_reserve(now + Duration::minutes(11), 1).unwrap_err();
        assert_eq!(err, VaultError::SessionExpired);
        assert_eq!(s.state(), SessionState::Expired);
        assert!(s.write_key().is_err());
    }

    #[test]
    fn expiry_takes_precedence_over_rate_window() {
        let now = Utc::now();
        let mut s = active_session(1, now);
        s.try_reserve(now, 1).unwrap();
        let _ = s.try_reserve(now, 1);
        assert_eq!(s.state(), SessionState::RateLimited);

        s.refresh(now + Duration::minutes(11));
        assert_eq!(s.state(), SessionState::Expired);
    }

    #[test]
    fn retry_after_counts_down_to_window_end() {
        let now = Utc::now();
        let s = active_session(1, now);
        assert_eq!(
            s.retry_after(now + Duration::seconds(45)),
            std::time::Duration::from_secs(15)
        );
        assert_eq!(
            s.retry_after(now + Duration::seconds(90)),
            std::time::Duration::ZERO
        );
    }

    #[test]
    fn older_versions_install_alongside_write_key() {
        let mut s = EncryptionSession::new("acme", 2, 0, &policy(5), Utc::now());
        s.activate(TenantKey::new("acme", 2, [2u8; KEY_LEN]), Utc::now());
        s.install_key(TenantKey::new("acme", 1, [1u8; KEY_LEN]));
        assert!(s.key(1).is_some());
        assert_eq!(s.write_key().unwrap().version(), 2);
        s.expire();
        assert!(s.key(1).is_none());
    }

    #[test]
    fn state_names() {
        assert_eq!(SessionState::RateLimited.to_string(), "rate_limited");
        assert!(SessionState::Expired.is_terminal());
        assert!(!SessionState::RateLimited.is_terminal());
    }
}
