//! Tracing setup: structured JSON logs plus optional OTLP span export.
//!
//! # Telemetry invariants
//!
//! - **No plaintext, token text or key material** may appear in any span
//!   attribute or log field. Tenant ids, key ids and error codes are fine.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`); `RUST_LOG`
//!   overrides it when set.
//! - Audit events are logged under the `audit` target.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
