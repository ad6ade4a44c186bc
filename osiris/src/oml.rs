//! The OML pipeline document: parsing, identifier newtypes and the
//! validation pass that gates compilation.

pub mod document;
pub mod validator;

pub use document::{
    Backoff, InputRef, OmlDocument, Pipeline, PipelineId, RetryPolicy, StepDecl, StepId,
    OML_VERSION,
};
pub use validator::validate;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OmlError {
    #[error("document is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Canon(#[from] crate::canon::CanonError),
}
