//! Request and response types exchanged with the field-vault HTTP service.
//!
//! Tokens travel as `base64(ciphertext):base64(nonce)` strings. The tenant id
//! and derivation version are not embedded in the token; callers persist them
//! alongside it and send them back on decryption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Single field
// ---------------------------------------------------------------------------

/// Request body for `POST /fields/encrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptFieldRequest {
    /// Tenant whose key protects the field.
    pub tenant_id: String,
    /// Plaintext value. The empty string is a valid input.
    pub plaintext: String,
}

/// Successful response body for `POST /fields/encrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptFieldResponse {
    /// Textual token, `base64(ciphertext):base64(nonce)`.
    pub token: String,
    /// Derivation version the token was sealed under. Persist it with the token.
    pub derivation_version: u32,
}

/// Request body for `POST /fields/decrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptFieldRequest {
    /// Tenant whose key protects the field.
    pub tenant_id: String,
    /// Token previously returned by `/fields/encrypt`.
    pub token: String,
    /// Version the token was sealed under; defaults to the current version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_version: Option<u32>,
}

/// Successful response body for `POST /fields/decrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptFieldResponse {
    /// Recovered plaintext.
    pub plaintext: String,
}

// ---------------------------------------------------------------------------
// Batches and records
// ---------------------------------------------------------------------------

/// Request body for `POST /fields/encrypt-batch` and `POST /fields/decrypt-batch`.
///
/// `fields` maps field names to string values (plaintexts or tokens). Key
/// order is preserved in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Tenant whose key protects the fields.
    pub tenant_id: String,
    /// Field name → value. Every value must be a JSON string.
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Version used for decryption; ignored when encrypting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_version: Option<u32>,
}

/// Successful response body for the batch endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Field name → transformed value, in request order.
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Version used for the operation.
    pub derivation_version: u32,
}

/// Request body for `POST /records/encrypt` and `POST /records/decrypt`.
///
/// Only the configured PII paths of `record` are transformed; everything else
/// is returned untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordRequest {
    /// Tenant whose key protects the record's PII fields.
    pub tenant_id: String,
    /// Arbitrary JSON record.
    pub record: serde_json::Value,
    /// Version used for decryption; ignored when encrypting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_version: Option<u32>,
}

/// Successful response body for the record endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordResponse {
    /// Record with its PII fields transformed.
    pub record: serde_json::Value,
    /// Number of fields that were transformed.
    pub fields_transformed: usize,
    /// Version used for the operation.
    pub derivation_version: u32,
}

// ---------------------------------------------------------------------------
// Sessions and keys
// ---------------------------------------------------------------------------

/// Response body for `GET /sessions/{tenant_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfoResponse {
    /// Tenant the session is bound to.
    pub tenant_id: String,
    /// Lifecycle state (`pending`, `active`, `rate_limited`, `expired`, `error`).
    pub state: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session stops accepting operations.
    pub expires_at: DateTime<Utc>,
    /// Operations performed in the current rate window.
    pub operation_count: u32,
    /// Operation budget per rate window.
    pub operation_limit: u32,
    /// Version new writes are sealed under.
    pub derivation_version: u32,
    /// Non-secret identifier of the write key, when one is loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Request body for `POST /keys/rotate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateRequest {
    /// New derivation version for writes. Must exceed the current one.
    pub derivation_version: u32,
}

/// Response body for `POST /keys/rotate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateResponse {
    /// Version writes used before the rotation.
    pub previous_version: u32,
    /// Version writes use from now on.
    pub derivation_version: u32,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"rate_limit_exceeded"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether the root secret could be fetched just now.
    pub secret_ready: bool,
    /// Version new writes are sealed under.
    pub derivation_version: u32,
    /// Number of named execution contexts currently held.
    pub open_contexts: usize,
}
