use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

#[cfg(target_family = "unix")]
use std::os::unix::fs::OpenOptionsExt;

use super::dirs::DirError;
use super::utils::{validate_path, FsError};
use super::LocalFile;

#[cfg(target_family = "unix")]
const FILE_MODE: u32 = 0o600;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("directory error: `{0}`")]
    Directory(#[from] DirError),
    #[error("error writing file: `{0}`")]
    Io(#[from] io::Error),
    #[error("invalid path: `{0}`")]
    InvalidPath(#[from] FsError),
    #[error("path has no parent directory: `{0}`")]
    NoParent(String),
}

pub trait FileWriter {
    fn write(&self, path: &Path, content: &[u8]) -> Result<(), WriteError>;

    /// Writes to a temporary sibling and renames over the destination, so a
    /// reader never observes a partially written file.
    fn atomic_write(&self, path: &Path, content: &[u8]) -> Result<(), WriteError>;
}

impl FileWriter for LocalFile {
    fn write(&self, path: &Path, content: &[u8]) -> Result<(), WriteError> {
        validate_path(path)?;
        let mut open_options = std::fs::OpenOptions::new();
        open_options.create(true).write(true).truncate(true);
        #[cfg(target_family = "unix")]
        open_options.mode(FILE_MODE);
        let mut file = open_options.open(path)?;
        file.write_all(content)?;
        Ok(())
    }

    fn atomic_write(&self, path: &Path, content: &[u8]) -> Result<(), WriteError> {
        validate_path(path)?;
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| WriteError::NoParent(path.display().to_string()))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| WriteError::NoParent(path.display().to_string()))?;
        // The temp name stays in the destination directory so the final
        // rename never crosses a filesystem boundary.
        let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
        self.write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
