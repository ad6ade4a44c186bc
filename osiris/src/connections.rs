//! Connection catalog and the `@family.alias` reference resolver.
//!
//! Resolution happens at compile time but never touches secret values: a
//! descriptor field of the form `${NAME}` is carried through literally, so
//! manifests and per-step configs stay secret-free. The execution engine
//! reads the named variables when it invokes the driver.

pub mod catalog;
pub mod resolver;

pub use catalog::ConnectionCatalog;
pub use resolver::{parse_reference, resolve, EnvRef, ResolvedConnection};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnError {
    #[error("unknown connection family `{0}`")]
    UnknownFamily(String),
    #[error("unknown alias `{alias}` in family `{family}`")]
    UnknownAlias { family: String, alias: String },
    #[error("family `{0}` has no default alias")]
    NoDefault(String),
    #[error("connection `{family}.{alias}` is missing required field `{field}`")]
    MissingField {
        family: String,
        alias: String,
        field: String,
    },
    #[error("invalid connection catalog: {0}")]
    Catalog(String),
    #[error("catalog is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Canon(#[from] crate::canon::CanonError),
}

impl ConnError {
    pub fn code(&self) -> &'static str {
        match self {
            ConnError::UnknownFamily(_) => "E_CONN_UNKNOWN_FAMILY",
            ConnError::UnknownAlias { .. } => "E_CONN_UNKNOWN_ALIAS",
            ConnError::NoDefault(_) => "E_CONN_NO_DEFAULT",
            ConnError::MissingField { .. } => "E_CONN_MISSING_FIELD",
            ConnError::Catalog(_) | ConnError::Yaml(_) => "E_CONN_CATALOG",
            ConnError::Canon(inner) => inner.code(),
        }
    }
}
