//! Persistent allowlist of command lines an operator has approved.
//!
//! Stored as a sorted JSON array of exact command lines. Entries feed every
//! profile's `approved` set: a later run of the same command is no longer
//! held for review, but a deny pattern still wins.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::checkpoint::write_atomic;
use crate::error::{CoreError, IoContext, Result};

#[derive(Debug, Clone)]
pub struct Allowlist {
    path: PathBuf,
}

impl Allowlist {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every approved command line. A missing file is an empty list.
    pub fn read(&self) -> Result<BTreeSet<String>> {
        read_entries(&self.path)
    }

    /// Merge `commands` into the list. Returns the lines that were new.
    pub fn append(&self, commands: impl IntoIterator<Item = String>) -> Result<Vec<String>> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).at(parent)?;
        }
        let _lock = self.lock()?;

        let mut entries = read_entries(&self.path)?;
        let added: Vec<String> = commands
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .filter(|c| entries.insert(c.clone()))
            .collect();
        if added.is_empty() {
            return Ok(added);
        }

        let json = serde_json::to_vec_pretty(&entries)?;
        write_atomic(&self.path, &json)?;
        tracing::info!(path = %self.path.display(), added = added.len(), "allowlist updated");
        Ok(added)
    }

    fn lock(&self) -> Result<File> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        let lock_path = PathBuf::from(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .at(&lock_path)?;
        file.lock_exclusive().at(&lock_path)?;
        Ok(file)
    }
}

fn read_entries(path: &Path) -> Result<BTreeSet<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(CoreError::io(path, e)),
    }
}
