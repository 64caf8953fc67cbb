//! Local [`SecretSource`] implementations.

use std::{io::ErrorKind, path::PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use zeroize::Zeroizing;

use super::{RootSecret, SecretSource, SecretSourceError};

/// Reads a base64-encoded root secret from an environment variable on every fetch.
#[derive(Debug, Clone)]
pub struct EnvSecretSource {
    var: String,
}

impl EnvSecretSource {
    /// Create a source reading the variable named `var`.
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl SecretSource for EnvSecretSource {
    fn fetch(&self) -> Result<RootSecret, SecretSourceError> {
        let encoded = Zeroizing::new(
            std::env::var(&self.var)
                .map_err(|_| SecretSourceError::NotFound(format!("env var {}", self.var)))?,
        );
        let bytes = STANDARD.decode(encoded.trim()).map_err(|_| {
            SecretSourceError::Malformed(format!("env var {} is not valid base64", self.var))
        })?;
        Ok(RootSecret::new(bytes))
    }
}

/// Reads the raw root secret bytes from a file on every fetch.
#[derive(Debug, Clone)]
pub struct FileSecretSource {
    path: PathBuf,
}

impl FileSecretSource {
    /// Create a source reading `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SecretSource for FileSecretSource {
    fn fetch(&self) -> Result<RootSecret, SecretSourceError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(RootSecret::new(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SecretSourceError::NotFound(
                self.path.display().to_string(),
            )),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(SecretSourceError::Denied(
                self.path.display().to_string(),
            )),
            Err(e) => Err(SecretSourceError::Io(e)),
        }
    }
}

/// Hands out copies of a secret held in memory. Intended for tests and for
/// embedding applications that obtain the secret themselves.
#[derive(Debug, Clone)]
pub struct StaticSecretSource {
    secret: RootSecret,
}

impl StaticSecretSource {
    /// Create a source that always returns `secret`.
    pub fn new(secret: impl Into<RootSecret>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl SecretSource for StaticSecretSource {
    fn fetch(&self) -> Result<RootSecret, SecretSourceError> {
        Ok(self.secret.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn env_source_decodes_base64() {
        let var = "FIELD_VAULT_TEST_ENV_SOURCE_OK";
        std::env::set_var(var, STANDARD.encode([9u8; 32]));
        let secret = EnvSecretSource::new(var).fetch().unwrap();
        assert_eq!(secret.expose(), &[9u8; 32][..]);
        std::env::remove_var(var);
    }

    #[test]
    fn env_source_missing_var_is_not_found() {
        let err = EnvSecretSource::new("FIELD_VAULT_TEST_ENV_SOURCE_MISSING")
            .fetch()
            .unwrap_err();
        assert!(matches!(err, SecretSourceError::NotFound(_)));
    }

    #[test]
    fn env_source_rejects_bad_base64() {
        let var = "FIELD_VAULT_TEST_ENV_SOURCE_BAD";
        std::env::set_var(var, "not base64 at all!");
        let err = EnvSecretSource::new(var).fetch().unwrap_err();
        assert!(matches!(err, SecretSourceError::Malformed(_)));
        std::env::remove_var(var);
    }

    #[test]
    fn file_source_reads_raw_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xAB; 48]).unwrap();
        let secret = FileSecretSource::new(file.path()).fetch().unwrap();
        assert_eq!(secret.len(), 48);
    }

    #[test]
    fn file_source_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileSecretSource::new(dir.path().join("absent"))
            .fetch()
            .unwrap_err();
        assert!(matches!(err, SecretSourceError::NotFound(_)));
    }

    #[test]
    fn static_source_returns_copies() {
        let source = StaticSecretSource::new(vec![5u8; 32]);
        let a = source.fetch().unwrap();
        let b = source.fetch().unwrap();
        assert_eq!(a.expose(), b.expose());
    }
}
