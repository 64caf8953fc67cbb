//! AES-256-GCM-SIV field encryption primitives.
//!
//! This module is free of session, audit and HTTP dependencies. It provides
//! the seal/open operations the facade runs under a session's tenant key.
//!
//! # Token format
//!
//! ```text
//! <base64(ciphertext+tag)>:<base64(nonce)>
//! ```
//!
//! The tenant id and derivation version travel next to the token in the
//! caller's storage; they are bound into the AEAD associated data.

pub mod cipher;

pub use cipher::{open, open_text, seal, CipherError, EncryptedToken, KEY_LEN, NONCE_LEN};
