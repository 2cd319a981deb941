//! Relay into a directory tree, e.g. a NAS mount.
//!
//! The remote path is resolved beneath the configured root; a leading `/`
//! refers to the root itself.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use super::{RelayConnection, RelayConnector, RelayError};

#[derive(Clone, Debug)]
pub struct DirectoryConnector {
    root: PathBuf,
}

impl DirectoryConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl RelayConnector for DirectoryConnector {
    fn open(&self) -> Result<Box<dyn RelayConnection>, RelayError> {
        if !self.root.is_dir() {
            return Err(RelayError::Connect(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(Box::new(DirectoryConnection {
            root: self.root.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!("dir://{}", self.root.display())
    }
}

struct DirectoryConnection {
    root: PathBuf,
}

impl DirectoryConnection {
    fn resolve(&self, remote_path: &str) -> Result<PathBuf, String> {
        let mut resolved = self.root.clone();
        for component in Path::new(remote_path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(format!("remote path '{}' escapes relay root", remote_path))
                }
            }
        }
        Ok(resolved)
    }
}

impl RelayConnection for DirectoryConnection {
    fn list(&mut self, remote_path: &str) -> Result<HashSet<String>, RelayError> {
        let list_error = |reason: String| RelayError::List {
            path: remote_path.to_string(),
            reason,
        };
        let dir = self.resolve(remote_path).map_err(list_error)?;
        if !dir.exists() {
            return Ok(HashSet::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| list_error(e.to_string()))?;
        let mut names = HashSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| list_error(e.to_string()))?;
            if let Some(name) = entry.file_name().to_str() {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    }

    fn upload(&mut self, remote_path: &str, name: &str, bytes: &[u8]) -> Result<(), RelayError> {
        let upload_error = |reason: String| RelayError::Upload {
            name: name.to_string(),
            reason,
        };
        if name.contains('/') || name.contains('\\') || name == ".." {
            return Err(upload_error("file name must not contain a path".to_string()));
        }
        let dir = self.resolve(remote_path).map_err(upload_error)?;
        std::fs::create_dir_all(&dir).map_err(|e| upload_error(e.to_string()))?;

        // Write then rename so a partial file never shows up in listings.
        let partial = dir.join(format!(".{}.partial", name));
        std::fs::write(&partial, bytes).map_err(|e| upload_error(e.to_string()))?;
        std::fs::rename(&partial, dir.join(name)).map_err(|e| upload_error(e.to_string()))?;
        Ok(())
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_then_list_round_trip() {
        let root = tempfile::tempdir().expect("tempdir");
        let connector = DirectoryConnector::new(root.path());
        let mut conn = connector.open().expect("open");

        conn.upload("/snapshots", "cam1_2024-01-01_12-00-00.jpg", b"jpeg")
            .expect("upload");
        let names = conn.list("/snapshots").expect("list");
        assert_eq!(names.len(), 1);
        assert!(names.contains("cam1_2024-01-01_12-00-00.jpg"));
        assert_eq!(
            std::fs::read(root.path().join("snapshots/cam1_2024-01-01_12-00-00.jpg"))
                .expect("read"),
            b"jpeg"
        );
    }

    #[test]
    fn missing_remote_directory_lists_empty() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut conn = DirectoryConnector::new(root.path()).open().expect("open");
        assert!(conn.list("/nothing/here").expect("list").is_empty());
    }

    #[test]
    fn rejects_paths_outside_root() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut conn = DirectoryConnector::new(root.path()).open().expect("open");
        assert!(conn.list("../etc").is_err());
        assert!(conn.upload("/", "../escape.jpg", b"x").is_err());
    }

    #[test]
    fn missing_root_fails_to_connect() {
        let root = tempfile::tempdir().expect("tempdir");
        let connector = DirectoryConnector::new(root.path().join("absent"));
        assert!(matches!(connector.open(), Err(RelayError::Connect(_))));
    }
}
