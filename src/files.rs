//! Body file access.

use crate::error::FileError;
use std::path::{Component, Path, PathBuf};

/// Source of response body files.
pub trait FileSource: Send + Sync {
    /// Read a text file by its name relative to the source.
    fn read_text_file(&self, name: &str) -> Result<String, FileError>;
}

/// Files under a root directory. Names may not escape the root.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, FileError> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(FileError::OutsideRoot(name.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl FileSource for DirectorySource {
    fn read_text_file(&self, name: &str) -> Result<String, FileError> {
        let path = self.resolve(name)?;
        std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound(name.to_string()),
            _ => FileError::Io {
                path: name.to_string(),
                source: e,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_file_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("users")).unwrap();
        std::fs::write(dir.path().join("users/1.json"), r#"{"id":1}"#).unwrap();

        let source = DirectorySource::new(dir.path());
        assert_eq!(source.read_text_file("users/1.json").unwrap(), r#"{"id":1}"#);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path());
        assert!(matches!(
            source.read_text_file("nope.txt"),
            Err(FileError::NotFound(name)) if name == "nope.txt"
        ));
    }

    #[test]
    fn test_rejects_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path());
        assert!(matches!(
            source.read_text_file("../secret"),
            Err(FileError::OutsideRoot(_))
        ));
        assert!(matches!(
            source.read_text_file("/etc/passwd"),
            Err(FileError::OutsideRoot(_))
        ));
    }
}
