//! Checkpoints: pre/post hashes and pre-image blobs for committed writes.
//!
//! The manifest is persisted before each write is applied (pre-image) and
//! again after (post hash), so a crash between the two leaves an entry with
//! a pre-image and no post hash. Rollback treats such an entry as a
//! conflict unless forced.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blob::{content_hash, BlobStore};
use crate::error::{CoreError, IoContext, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Hash of the file before the first committed write; `None` if it did
    /// not exist.
    pub pre_hash: Option<String>,
    /// Pre-image blob; `None` if the file did not exist.
    pub blob_id: Option<String>,
    /// Hash after the last successfully applied write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: BTreeMap<PathBuf, CheckpointEntry>,
}

/// A checkpoint being built during commit, backed by its manifest file and
/// blob directory.
pub struct CheckpointWriter {
    checkpoint: Checkpoint,
    manifest: PathBuf,
    blobs: BlobStore,
}

impl CheckpointWriter {
    pub fn create(
        session_id: &str,
        manifest: PathBuf,
        blobs: BlobStore,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            checkpoint: Checkpoint {
                session_id: session_id.to_string(),
                created_at: now,
                entries: BTreeMap::new(),
            },
            manifest,
            blobs,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Record the pre-image of `path` if this is the first write to it, and
    /// persist the manifest. Later writes to the same path keep the
    /// original pre-image.
    pub fn record_pre(&mut self, path: &Path) -> Result<()> {
        if self.checkpoint.entries.contains_key(path) {
            return Ok(());
        }
        let entry = match fs::read(path) {
            Ok(content) => {
                let blob_id = self.blobs.put(&content)?;
                CheckpointEntry {
                    pre_hash: Some(content_hash(&content)),
                    blob_id: Some(blob_id),
                    post_hash: None,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => CheckpointEntry::default(),
            Err(e) => return Err(CoreError::io(path, e)),
        };
        self.checkpoint.entries.insert(path.to_path_buf(), entry);
        self.save()
    }

    /// Record the hash of `path` after a successful write.
    pub fn record_post(&mut self, path: &Path, post_hash: String) -> Result<()> {
        if let Some(entry) = self.checkpoint.entries.get_mut(path) {
            entry.post_hash = Some(post_hash);
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.checkpoint)?;
        write_atomic(&self.manifest, &json)
    }
}

/// Load a checkpoint manifest.
pub fn load(manifest: &Path) -> Result<Checkpoint> {
    match fs::read(manifest) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CoreError::NotFound(format!(
            "checkpoint {}",
            manifest.display()
        ))),
        Err(e) => Err(CoreError::io(manifest, e)),
    }
}

/// Replace `path` with `content` atomically, keeping existing permissions.
/// A new file is private to the owner.
///
/// The parent directory must exist.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    replace(path, content, None)
}

/// Like [`write_atomic`], for files the script asked for: a new file gets
/// mode 0644 instead of 0600.
pub fn write_target(path: &Path, content: &[u8]) -> Result<()> {
    replace(path, content, Some(NEW_TARGET_MODE))
}

/// Mode of a file that a commit or rollback creates.
const NEW_TARGET_MODE: u32 = 0o644;

fn replace(path: &Path, content: &[u8], new_mode: Option<u32>) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let permissions = match fs::metadata(path) {
        Ok(m) => Some(m.permissions()),
        Err(_) => new_mode.map(fs::Permissions::from_mode),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(parent).at(parent)?;
    tmp.write_all(content).at(path)?;
    tmp.as_file().sync_all().at(path)?;
    if let Some(perms) = permissions {
        fs::set_permissions(tmp.path(), perms).at(path)?;
    }
    tmp.persist(path).map_err(|e| CoreError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn writer(root: &Path) -> CheckpointWriter {
        let blobs = BlobStore::open(root.join("checkpoint")).unwrap();
        CheckpointWriter::create("s1", root.join("checkpoint.json"), blobs, Utc::now())
    }

    #[test]
    fn pre_image_of_existing_file_is_stored() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("conf");
        fs::write(&target, b"old").unwrap();

        let mut w = writer(dir.path());
        w.record_pre(&target).unwrap();
        let entry = &w.checkpoint().entries[&target];
        assert_eq!(entry.pre_hash.as_deref(), Some(content_hash(b"old").as_str()));
        let blobs = BlobStore::open(dir.path().join("checkpoint")).unwrap();
        assert_eq!(blobs.get(entry.blob_id.as_ref().unwrap()).unwrap(), b"old");
    }

    #[test]
    fn absent_file_has_no_pre_image() {
        let dir = tempdir().unwrap();
        let mut w = writer(dir.path());
        let target = dir.path().join("new");
        w.record_pre(&target).unwrap();
        assert_eq!(w.checkpoint().entries[&target], CheckpointEntry::default());
    }

    #[test]
    fn first_pre_image_wins() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        fs::write(&target, b"v1").unwrap();
        let mut w = writer(dir.path());
        w.record_pre(&target).unwrap();
        fs::write(&target, b"v2").unwrap();
        w.record_pre(&target).unwrap();
        assert_eq!(
            w.checkpoint().entries[&target].pre_hash,
            Some(content_hash(b"v1"))
        );
    }

    #[test]
    fn manifest_is_persisted_before_post_hash() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        let mut w = writer(dir.path());
        w.record_pre(&target).unwrap();

        let on_disk = load(&dir.path().join("checkpoint.json")).unwrap();
        assert!(on_disk.entries[&target].post_hash.is_none());

        w.record_post(&target, content_hash(b"new")).unwrap();
        let on_disk = load(&dir.path().join("checkpoint.json")).unwrap();
        assert_eq!(on_disk.entries[&target].post_hash, Some(content_hash(b"new")));
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load(&dir.path().join("checkpoint.json")),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn write_atomic_keeps_permissions() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("script.sh");
        fs::write(&target, b"old").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o750)).unwrap();

        write_atomic(&target, b"new").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn new_targets_are_world_readable_and_internal_files_private() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("report.txt");
        write_target(&target, b"data").unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        let internal = dir.path().join("session.json");
        write_atomic(&internal, b"{}").unwrap();
        let mode = fs::metadata(&internal).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn write_target_keeps_existing_permissions() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("run.sh");
        fs::write(&target, b"old").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o700)).unwrap();
        write_target(&target, b"new").unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn write_atomic_requires_parent() {
        let dir = tempdir().unwrap();
        assert!(write_atomic(&dir.path().join("missing/f"), b"x").is_err());
    }
}
