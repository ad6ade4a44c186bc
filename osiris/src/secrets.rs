//! Secret declaration, redaction and leak detection.
//!
//! Component specs declare which configuration paths hold secrets; this
//! module computes the effective path set, rewrites values for output, and
//! refuses artifacts that would carry a raw secret to disk.

pub mod path;
pub mod policy;

pub use path::SecretPath;
pub use policy::{RedactionPolicy, SecretPolicy, Strategy, DEFAULT_MASK};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("secret value leaked at `{path}`")]
    Leak { path: String },
    #[error("invalid secret path `{0}`")]
    InvalidPath(String),
    #[error(transparent)]
    Canon(#[from] crate::canon::CanonError),
}

impl SecretError {
    pub fn code(&self) -> &'static str {
        match self {
            SecretError::Leak { .. } => "E_SECRET_LEAK",
            SecretError::InvalidPath(_) => "E_SECRET_PATH",
            SecretError::Canon(inner) => inner.code(),
        }
    }
}
