//! Content-addressed, write-once blob storage.
//!
//! Blobs are named by the first 16 hex chars of their SHA-256 and stored as
//! `<id>.blob`. Writes are create-if-absent: two writers racing on the same
//! content both succeed and leave one file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{CoreError, IoContext, Result};

pub const BLOB_EXTENSION: &str = "blob";

/// Hex chars of the hash kept in a blob id.
pub const BLOB_ID_LEN: usize = 16;

/// Full SHA-256 of `content`, lowercase hex.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Hash of the file at `path`, or `None` if it does not exist.
pub fn hash_file(path: &Path) -> Result<Option<String>> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content_hash(&content))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::io(path, e)),
    }
}

/// Blob id for a full content hash.
pub fn blob_id(hash: &str) -> &str {
    &hash[..BLOB_ID_LEN.min(hash.len())]
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a blob directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).at(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{BLOB_EXTENSION}"))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.path_of(id).is_file()
    }

    /// Store `content`, returning its id. Existing blobs are never rewritten.
    pub fn put(&self, content: &[u8]) -> Result<String> {
        let hash = content_hash(content);
        let id = blob_id(&hash).to_string();
        let path = self.path_of(&id);
        if path.is_file() {
            return Ok(id);
        }

        // Write to a temp file, then link into place: readers never see a
        // partial blob, and an existing blob is left alone.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).at(&self.dir)?;
        tmp.write_all(content).at(tmp.path())?;
        tmp.as_file().sync_all().at(tmp.path())?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(CoreError::io(&path, e.error)),
        }
        tracing::trace!(blob = %id, size = content.len(), "blob stored");
        Ok(id)
    }

    /// Load a blob and verify it still hashes to its id.
    pub fn get(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.path_of(id);
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(format!("blob {id}")));
            }
            Err(e) => return Err(CoreError::io(&path, e)),
        };
        if blob_id(&content_hash(&content)) != id {
            return Err(CoreError::Corrupt { id: id.to_string() });
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn put_get() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();
        let id = store.put(b"hello").unwrap();
        assert_eq!(id.len(), BLOB_ID_LEN);
        assert!(store.path_of(&id).to_string_lossy().ends_with(".blob"));
        assert_eq!(store.get(&id).unwrap(), b"hello");
    }

    #[test]
    fn put_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let a = store.put(b"same").unwrap();
        let b = store.put(b"same").unwrap();
        assert_eq!(a, b);
        let blobs = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(blobs, 1);
    }

    #[test]
    fn missing_blob_is_not_found() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get("0000000000000000"),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn tampered_blob_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let id = store.put(b"original").unwrap();
        fs::write(store.path_of(&id), b"tampered").unwrap();
        assert!(matches!(store.get(&id), Err(CoreError::Corrupt { .. })));
    }

    #[test]
    fn hash_file_absent_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(hash_file(&dir.path().join("nope")).unwrap(), None);
        let p = dir.path().join("f");
        fs::write(&p, b"x").unwrap();
        assert_eq!(hash_file(&p).unwrap(), Some(content_hash(b"x")));
    }
}
