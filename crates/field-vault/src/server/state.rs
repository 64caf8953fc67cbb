//! Shared application state injected into every Axum handler.

use std::sync::Arc;
use std::time::Duration;

use super::contexts::ContextTable;
use crate::facade::EncryptionFacade;
use crate::pii::PiiFieldPaths;

/// Per-request timeout used unless [`AppState::with_request_timeout`] sets one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all request handlers.
///
/// All fields are cheaply cloneable (`Arc`-wrapped or already `Arc`-backed) so
/// that Axum can clone the state for each request without copying expensive data.
#[derive(Clone)]
pub struct AppState {
    /// Field encryption entry point.
    pub facade: EncryptionFacade,
    /// Named execution contexts kept across requests.
    pub contexts: ContextTable,
    /// PII paths transformed by the record endpoints.
    pub pii_fields: Arc<PiiFieldPaths>,
    /// Name of the HTTP header identifying a named context.
    pub context_header_name: Arc<String>,
    /// Time a request may take before the router answers 408.
    pub request_timeout: Duration,
}

impl AppState {
    /// Create a new [`AppState`] holding at most `max_contexts` named contexts.
    pub fn new(
        facade: EncryptionFacade,
        pii_fields: PiiFieldPaths,
        context_header_name: String,
        max_contexts: usize,
    ) -> Self {
        Self {
            facade,
            contexts: ContextTable::new(max_contexts),
            pii_fields: Arc::new(pii_fields),
            context_header_name: Arc::new(context_header_name),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Replace the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
