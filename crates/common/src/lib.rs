//! Error taxonomy and wire types shared across `field-vault` crates.

pub mod error;
pub mod protocol;

pub use error::{ErrorKind, ServiceError};
