//! Audit events for session lifecycle transitions and operation failures.
//!
//! Events are handed to an [`AuditSink`] and never stored here. Recording is
//! best-effort: a sink error is logged and the encryption operation carries
//! on regardless.

use chrono::{DateTime, Utc};
use common::ErrorKind;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::session::SessionState;

/// What the audited event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// A session lifecycle transition.
    Session,
    /// Single-field encryption.
    EncryptField,
    /// Single-field decryption.
    DecryptField,
    /// Batch encryption.
    EncryptFields,
    /// Batch decryption.
    DecryptFields,
    /// Explicit invalidation of a tenant's sessions.
    InvalidateSession,
}

/// Result recorded for an audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// A session moved between states; `from` is `None` on creation.
    Transitioned {
        /// State before the transition.
        from: Option<SessionState>,
        /// State after the transition.
        to: SessionState,
    },
    /// An operation failed with the given kind.
    Failed {
        /// Stable error kind propagated to the caller.
        kind: ErrorKind,
    },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    /// Tenant the event concerns.
    pub tenant_id: String,
    /// What was being done.
    pub operation: AuditOperation,
    /// How it ended.
    pub outcome: AuditOutcome,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Short free-text reason; never contains field values or key material.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Returns `true` for [`AuditOutcome::Failed`] events.
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, AuditOutcome::Failed { .. })
    }
}

/// Error returned by an [`AuditSink`] that could not record an event.
#[derive(Debug, Error)]
#[error("audit sink unavailable: {0}")]
pub struct AuditError(pub String);

/// Consumer of audit events.
pub trait AuditSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Writes each event as a structured `tracing` record under the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let outcome =
            serde_json::to_string(&event.outcome).map_err(|e| AuditError(e.to_string()))?;
        info!(
            target: "audit",
            tenant_id = %event.tenant_id,
            operation = ?event.operation,
            outcome = %outcome,
            timestamp = %event.timestamp,
            reason = event.reason.as_deref(),
            "audit event"
        );
        Ok(())
    }
}

/// Keeps events in memory. Useful to embedders' tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Copy of the failure events recorded so far.
    pub fn failures(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.is_failure())
            .cloned()
            .collect()
    }

    /// Forget every recorded event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
