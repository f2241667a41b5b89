//! Byte storage for registered files, addressed by file id.

use crate::{Result, StorageError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Local storage of file payloads.
pub trait ContentStore: Send + Sync {
    /// Fetch the bytes stored under `file_id`, if any.
    fn get(&self, file_id: &str) -> Result<Option<Vec<u8>>>;

    /// Store `bytes` under `file_id`, replacing any previous content.
    fn put(&self, file_id: &str, bytes: &[u8]) -> Result<()>;

    /// Delete whatever is stored under `file_id`. Missing content is not an error.
    fn remove(&self, file_id: &str) -> Result<()>;

    fn contains(&self, file_id: &str) -> Result<bool> {
        Ok(self.get(file_id)?.is_some())
    }
}

/// Reject ids that could escape the store directory.
fn checked_id(file_id: &str) -> Result<&str> {
    let invalid = file_id.is_empty()
        || file_id == "."
        || file_id == ".."
        || file_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StorageError::InvalidFileId(file_id.to_string()));
    }
    Ok(file_id)
}

/// One file per id inside a directory.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Open (or create) a content store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| StorageError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, file_id: &str) -> Result<PathBuf> {
        Ok(self.root.join(checked_id(file_id)?))
    }
}

impl ContentStore for FsContentStore {
    fn get(&self, file_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(file_id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io(path, err)),
        }
    }

    fn put(&self, file_id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(file_id)?;
        let mut temp = path.clone().into_os_string();
        temp.push(".part");
        let temp = PathBuf::from(temp);
        fs::write(&temp, bytes).map_err(|e| StorageError::io(&temp, e))?;
        fs::rename(&temp, &path).map_err(|e| StorageError::io(&path, e))?;
        debug!(file_id, bytes = bytes.len(), "Stored file content");
        Ok(())
    }

    fn remove(&self, file_id: &str) -> Result<()> {
        let path = self.path_for(file_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(path, err)),
        }
    }

    fn contains(&self, file_id: &str) -> Result<bool> {
        Ok(self.path_for(file_id)?.is_file())
    }
}

/// In-memory content store for tests and small deployments.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl ContentStore for MemoryContentStore {
    fn get(&self, file_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.read().get(file_id).cloned())
    }

    fn put(&self, file_id: &str, bytes: &[u8]) -> Result<()> {
        checked_id(file_id)?;
        self.files
            .write()
            .insert(file_id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, file_id: &str) -> Result<()> {
        self.files.write().remove(file_id);
        Ok(())
    }

    fn contains(&self, file_id: &str) -> Result<bool> {
        Ok(self.files.read().contains_key(file_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fs_store_put_and_get() {
        let dir = tempdir().unwrap();
        let store = FsContentStore::open(dir.path().join("files")).unwrap();

        assert_eq!(store.get("f1").unwrap(), None);
        assert!(!store.contains("f1").unwrap());

        store.put("f1", b"payload").unwrap();
        assert_eq!(store.get("f1").unwrap(), Some(b"payload".to_vec()));
        assert!(store.contains("f1").unwrap());

        store.put("f1", b"replaced").unwrap();
        assert_eq!(store.get("f1").unwrap(), Some(b"replaced".to_vec()));

        store.remove("f1").unwrap();
        assert!(!store.contains("f1").unwrap());
        store.remove("f1").unwrap();
        assert!(store.remove("../f1").is_err());
    }

    #[test]
    fn test_fs_store_rejects_traversal() {
        let dir = tempdir().unwrap();
        let store = FsContentStore::open(dir.path()).unwrap();
        for bad in ["", "..", "../etc/passwd", "a/b", "a\\b"] {
            assert!(
                matches!(store.put(bad, b"x"), Err(StorageError::InvalidFileId(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryContentStore::new();
        assert!(store.is_empty());
        store.put("f1", &[1, 2, 3]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("f1").unwrap(), Some(vec![1, 2, 3]));
        assert!(store.contains("f1").unwrap());
        assert!(!store.contains("f2").unwrap());
        store.remove("f1").unwrap();
        assert!(store.is_empty());
    }
}
