use super::compiler::CompileResult;
use crate::canon::{self, CanonError};
use fs::dirs::{DirError, DirectoryManager, DirectoryManagerFs};
use fs::writer::{FileWriter, WriteError};
use fs::LocalFile;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum EmitError {
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Dir(#[from] DirError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Canon(#[from] CanonError),
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes the compiled artifact set to `out_dir`.
///
/// Everything is staged into a sibling directory and renamed into place, so
/// a failed emission leaves either the previous artifact set or nothing.
pub fn emit(result: &CompileResult, out_dir: &Path) -> Result<(), EmitError> {
    let staging = out_dir.with_extension("staging");
    let dirs = DirectoryManagerFs;
    let writer = LocalFile;

    dirs.delete(&staging)?;
    dirs.create(&staging.join("cfg"))?;

    writer.write(
        &staging.join("manifest.yaml"),
        result.manifest.to_yaml()?.as_bytes(),
    )?;
    for (step_id, config) in &result.configs {
        writer.write(
            &staging.join(format!("cfg/{step_id}.json")),
            &canon::canonicalize(config)?,
        )?;
    }
    writer.write(
        &staging.join("meta.json"),
        &serde_json::to_vec_pretty(&result.meta)?,
    )?;
    writer.write(
        &staging.join("effective_config.json"),
        &canon::canonicalize(&result.effective_config)?,
    )?;

    dirs.delete(out_dir)?;
    std::fs::rename(&staging, out_dir)?;
    info!(out_dir = %out_dir.display(), "compiled artifacts written");
    Ok(())
}
