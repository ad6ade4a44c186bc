use std::fs::DirBuilder;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::instrument;

use super::utils::{validate_path, FsError};

#[cfg(target_family = "unix")]
const DIR_MODE: u32 = 0o700;

#[derive(Error, Debug)]
pub enum DirError {
    #[error("directory error: `{0}`")]
    Io(#[from] io::Error),
    #[error("invalid path: `{0}`")]
    InvalidPath(#[from] FsError),
}

pub trait DirectoryManager {
    /// Creates the directory and any missing parents. Creating an existing
    /// directory is not an error.
    fn create(&self, path: &Path) -> Result<(), DirError>;

    /// Deletes the directory and its contents. A missing directory is not an
    /// error.
    fn delete(&self, path: &Path) -> Result<(), DirError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DirectoryManagerFs;

impl DirectoryManager for DirectoryManagerFs {
    fn create(&self, path: &Path) -> Result<(), DirError> {
        validate_path(path)?;
        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(target_family = "unix")]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(DIR_MODE);
        }
        builder.create(path)?;
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    fn delete(&self, path: &Path) -> Result<(), DirError> {
        validate_path(path)?;
        if !path.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_recursive_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/run_1/artifacts/step");

        let manager = DirectoryManagerFs;
        manager.create(&path).unwrap();
        manager.create(&path).unwrap();

        assert!(path.is_dir());
        #[cfg(target_family = "unix")]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(DIR_MODE, mode & 0o777);
        }
    }

    #[test]
    fn delete_of_missing_directory_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DirectoryManagerFs;
        assert!(manager.delete(&dir.path().join("not-there")).is_ok());
    }

    #[test]
    fn paths_with_parent_components_are_rejected() {
        let manager = DirectoryManagerFs;
        assert!(manager.create(Path::new("some/../escape")).is_err());
        assert!(manager.delete(Path::new("some/../escape")).is_err());
    }
}
