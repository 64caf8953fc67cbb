//! `field-vault`: per-tenant field encryption.
//!
//! Keys form a hierarchy: one root secret, from which a key per
//! (tenant, derivation version) is derived with HKDF-SHA256. Fields are
//! sealed with AES-256-GCM-SIV under those keys. Keys live only inside
//! bounded-lifetime, rate-limited sessions owned by an explicit execution
//! context, and are zeroized when the session ends.
//!
//! ```text
//! EncryptionFacade ─▶ SessionRegistry ─▶ KeyDerivationService ─▶ SecretSource
//!        │                  │
//!        └──▶ crypto::seal / open (TenantKey from the session)
//! ```
//!
//! The [`server`] module exposes the facade over HTTP; the `field-vault`
//! binary wires everything from environment configuration.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod derivation;
pub mod error;
pub mod facade;
pub mod pii;
pub mod secret;
pub mod server;
pub mod session;
pub mod telemetry;

pub use error::VaultError;
pub use facade::EncryptionFacade;
pub use session::{SessionContext, SessionRegistry};
