//! Configuration loading and validation for the field-vault service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is invalid.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::pii::{parse_pii_fields, PiiFieldPaths, DEFAULT_PII_FIELDS};
use crate::secret::{EnvSecretSource, FileSecretSource, SecretSource};
use crate::session::SessionPolicy;

/// Where the root secret is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSourceKind {
    /// Base64 value of the environment variable named by `root_secret_var`.
    Env,
    /// Raw bytes of the file at `root_secret_path`.
    File,
}

/// Validated service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root secret backend.
    #[serde(default = "default_secret_source")]
    pub secret_source: SecretSourceKind,

    /// Environment variable holding the base64 root secret (`env` source).
    #[serde(default = "default_root_secret_var")]
    pub root_secret_var: String,

    /// File holding the raw root secret. **Required** for the `file` source.
    #[serde(default)]
    pub root_secret_path: Option<String>,

    /// Upper bound on one secret fetch, in milliseconds.
    #[serde(default = "default_secret_timeout")]
    pub secret_timeout_ms: u64,

    /// Derivation version new tokens are sealed under at startup.
    #[serde(default = "default_derivation_version")]
    pub derivation_version: u32,

    /// Session lifetime in seconds.
    #[serde(default = "default_session_lifetime")]
    pub session_lifetime_secs: u64,

    /// Length of one rate-limit window in seconds.
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,

    /// Field operations allowed per session per window.
    #[serde(default = "default_rate_budget")]
    pub rate_budget: u32,

    /// Comma-separated PII paths for the record endpoints.
    #[serde(default = "default_pii_fields")]
    pub pii_fields: String,

    /// Port the HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// HTTP header naming a long-lived execution context.
    #[serde(default = "default_context_header")]
    pub context_header_name: String,

    /// Upper bound on concurrently held named contexts.
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,

    /// Seconds a request may run before it is answered with 408.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// OTLP endpoint for span export. Spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_secret_source() -> SecretSourceKind {
    SecretSourceKind::Env
}
fn default_root_secret_var() -> String {
    "FIELD_VAULT_ROOT_SECRET".into()
}
fn default_secret_timeout() -> u64 {
    2_000
}
fn default_derivation_version() -> u32 {
    1
}
fn default_session_lifetime() -> u64 {
    900
}
fn default_rate_window() -> u64 {
    60
}
fn default_rate_budget() -> u32 {
    1_000
}
fn default_pii_fields() -> String {
    DEFAULT_PII_FIELDS.join(",")
}
fn default_listen_port() -> u16 {
    8080
}
fn default_context_header() -> String {
    "X-Context-Id".into()
}
fn default_max_contexts() -> usize {
    1_024
}
fn default_request_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(config::Environment::default())
    }

    fn from_environment(env: config::Environment) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(env)
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<()> {
        match self.secret_source {
            SecretSourceKind::Env => ensure_non_empty(&self.root_secret_var, "ROOT_SECRET_VAR")?,
            SecretSourceKind::File => ensure_non_empty(
                self.root_secret_path.as_deref().unwrap_or_default(),
                "ROOT_SECRET_PATH",
            )?,
        }
        ensure_non_empty(&self.context_header_name, "CONTEXT_HEADER_NAME")?;
        if axum::http::HeaderName::from_bytes(self.context_header_name.as_bytes()).is_err() {
            anyhow::bail!("CONTEXT_HEADER_NAME must be a valid HTTP header name");
        }

        if self.secret_timeout_ms == 0 {
            anyhow::bail!("SECRET_TIMEOUT_MS must be > 0");
        }
        if self.derivation_version == 0 {
            anyhow::bail!("DERIVATION_VERSION must be >= 1");
        }
        if self.session_lifetime_secs == 0 || self.session_lifetime_secs > MAX_PERIOD_SECS {
            anyhow::bail!("SESSION_LIFETIME_SECS must be between 1 and {MAX_PERIOD_SECS}");
        }
        if self.rate_window_secs == 0 || self.rate_window_secs > MAX_PERIOD_SECS {
            anyhow::bail!("RATE_WINDOW_SECS must be between 1 and {MAX_PERIOD_SECS}");
        }
        if self.rate_budget == 0 {
            anyhow::bail!("RATE_BUDGET must be > 0");
        }
        if self.max_contexts == 0 {
            anyhow::bail!("MAX_CONTEXTS must be > 0");
        }
        if self.request_timeout_secs == 0 || self.request_timeout_secs > MAX_PERIOD_SECS {
            anyhow::bail!("REQUEST_TIMEOUT_SECS must be between 1 and {MAX_PERIOD_SECS}");
        }
        if self.pii_field_paths().is_empty() {
            anyhow::bail!("PII_FIELDS must name at least one path");
        }
        Ok(())
    }

    /// Session lifetime and rate-limit settings.
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            lifetime: chrono::Duration::seconds(clamp_secs(self.session_lifetime_secs)),
            rate_window: chrono::Duration::seconds(clamp_secs(self.rate_window_secs)),
            operation_limit: self.rate_budget,
        }
    }

    /// Upper bound on one secret fetch.
    pub fn secret_timeout(&self) -> Duration {
        Duration::from_millis(self.secret_timeout_ms)
    }

    /// Upper bound on one HTTP request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The parsed PII path set.
    pub fn pii_field_paths(&self) -> PiiFieldPaths {
        parse_pii_fields(&self.pii_fields)
    }

    /// Build the configured root secret source.
    pub fn build_secret_source(&self) -> Arc<dyn SecretSource> {
        match self.secret_source {
            SecretSourceKind::Env => Arc::new(EnvSecretSource::new(&self.root_secret_var)),
            SecretSourceKind::File => Arc::new(FileSecretSource::new(
                self.root_secret_path.clone().unwrap_or_default(),
            )),
        }
    }
}

/// Longest accepted session lifetime or rate window: one year.
const MAX_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs.min(MAX_PERIOD_SECS)).unwrap_or(0)
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            secret_source: default_secret_source(),
            root_secret_var: default_root_secret_var(),
            root_secret_path: None,
            secret_timeout_ms: default_secret_timeout(),
            derivation_version: default_derivation_version(),
            session_lifetime_secs: default_session_lifetime(),
            rate_window_secs: default_rate_window(),
            rate_budget: default_rate_budget(),
            pii_fields: default_pii_fields(),
            listen_port: default_listen_port(),
            context_header_name: default_context_header(),
            max_contexts: default_max_contexts(),
            request_timeout_secs: default_request_timeout(),
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map = vars
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect::<config::Map<String, String>>();
        config::Environment::default().source(Some(map))
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_secret_source(), SecretSourceKind::Env);
        assert_eq!(default_secret_timeout(), 2_000);
        assert_eq!(default_derivation_version(), 1);
        assert_eq!(default_session_lifetime(), 900);
        assert_eq!(default_rate_window(), 60);
        assert_eq!(default_rate_budget(), 1_000);
        assert_eq!(default_listen_port(), 8080);
        assert_eq!(default_context_header(), "X-Context-Id");
        assert_eq!(default_log_level(), "info");
        assert_eq!(base().request_timeout(), Duration::from_secs(30));
        assert_eq!(default_pii_fields(), "fiscal_code,first_name,last_name,email,phone");
        assert!(base().validate().is_ok());
    }

    #[test]
    fn loads_from_environment() {
        let cfg = Config::from_environment(env(&[
            ("SECRET_SOURCE", "file"),
            ("ROOT_SECRET_PATH", "/run/secrets/root"),
            ("RATE_BUDGET", "25"),
            ("DERIVATION_VERSION", "3"),
            ("PII_FIELDS", "email,contacts[].phone"),
            ("REQUEST_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.secret_source, SecretSourceKind::File);
        assert_eq!(cfg.rate_budget, 25);
        assert_eq!(cfg.derivation_version, 3);
        assert_eq!(cfg.pii_field_paths().len(), 2);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(5));
        assert!(cfg.otel_exporter_otlp_endpoint.is_none());
    }

    #[test]
    fn validate_rejects_file_source_without_path() {
        let cfg = Config {
            secret_source: SecretSourceKind::File,
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_version() {
        let cfg = Config {
            derivation_version: 0,
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_budget_and_window() {
        assert!(Config {
            rate_budget: 0,
            ..base()
        }
        .validate()
        .is_err());
        assert!(Config {
            rate_window_secs: 0,
            ..base()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn validate_rejects_zero_request_timeout() {
        let cfg = Config {
            request_timeout_secs: 0,
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_header_name() {
        assert!(Config {
            session_lifetime_secs: MAX_PERIOD_SECS + 1,
            ..base()
        }
        .validate()
        .is_err());
        let cfg = Config {
            context_header_name: "X Context".into(),
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn session_policy_uses_configured_values() {
        let cfg = Config {
            session_lifetime_secs: 120,
            rate_window_secs: 10,
            rate_budget: 5,
            ..base()
        };
        let policy = cfg.session_policy();
        assert_eq!(policy.lifetime, chrono::Duration::seconds(120));
        assert_eq!(policy.rate_window, chrono::Duration::seconds(10));
        assert_eq!(policy.operation_limit, 5);
    }
}
