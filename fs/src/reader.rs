use std::io;
use std::path::Path;
use thiserror::Error;

use super::LocalFile;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("error reading contents: `{0}`")]
    Io(#[from] io::Error),
    #[error("file not found: `{0}`")]
    FileNotFound(String),
}

pub trait FileReader {
    fn read_to_string(&self, path: &Path) -> Result<String, ReadError>;
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, ReadError>;
}

impl FileReader for LocalFile {
    fn read_to_string(&self, path: &Path) -> Result<String, ReadError> {
        if !path.is_file() {
            return Err(ReadError::FileNotFound(path.display().to_string()));
        }
        Ok(std::fs::read_to_string(path)?)
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, ReadError> {
        if !path.is_file() {
            return Err(ReadError::FileNotFound(path.display().to_string()));
        }
        Ok(std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let reader = LocalFile;
        let result = reader.read_to_string(Path::new("/a/path/that/does/not/exist"));
        assert_eq!(
            "file not found: `/a/path/that/does/not/exist`",
            result.unwrap_err().to_string()
        );
    }

    #[test]
    fn reads_back_written_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.txt");
        std::fs::write(&path, "payload").unwrap();

        let reader = LocalFile;
        assert_eq!("payload", reader.read_to_string(&path).unwrap());
        assert_eq!(b"payload".to_vec(), reader.read_bytes(&path).unwrap());
    }
}
