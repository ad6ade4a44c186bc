use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("dots disallowed in path `{0}`")]
    DotsInPath(String),
}

/// Rejects paths containing `..` components. Paths handed to this crate are
/// composed from validated identifiers, so a parent-dir component can only
/// mean an attempt to escape the session or compile tree.
pub fn validate_path(path: &Path) -> Result<(), FsError> {
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(FsError::DotsInPath(path.display().to_string()));
    }
    Ok(())
}
