//! Rollback: restore every file an Executed session touched to its
//! checkpointed pre-image.
//!
//! A file whose current hash differs from the recorded post hash was
//! modified after commit; that is a conflict. Without force, any conflict
//! aborts the whole rollback before a single file changes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::blob::{content_hash, hash_file};
use crate::checkpoint::{self, write_target, Checkpoint};
use crate::error::{CoreError, IoContext, Result};
use crate::session::{Session, SessionStatus};
use crate::store::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackAction {
    /// Put the pre-image back.
    Restore,
    /// The file did not exist before commit; remove it.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackEntry {
    pub path: PathBuf,
    pub action: RollbackAction,
    /// Hash on disk now; `None` if the file is gone.
    pub current_hash: Option<String>,
    /// Hash the commit left behind.
    pub expected_hash: Option<String>,
}

impl RollbackEntry {
    pub fn is_conflict(&self) -> bool {
        self.current_hash != self.expected_hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub session_id: String,
    pub dry_run: bool,
    pub force: bool,
    pub entries: Vec<RollbackEntry>,
}

impl RollbackReport {
    pub fn empty(session_id: &str, dry_run: bool, force: bool) -> Self {
        Self {
            session_id: session_id.to_string(),
            dry_run,
            force,
            entries: Vec::new(),
        }
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &RollbackEntry> {
        self.entries.iter().filter(|e| e.is_conflict())
    }

    /// Conflicting entries that were (or would be) overwritten anyway.
    pub fn forced(&self) -> impl Iterator<Item = &RollbackEntry> {
        self.conflicts().filter(move |_| self.force)
    }

    pub fn is_clean(&self) -> bool {
        self.conflicts().next().is_none()
    }
}

/// A planned entry together with the pre-image to restore.
struct Planned {
    entry: RollbackEntry,
    content: Option<Vec<u8>>,
}

pub struct RollbackEngine<'a> {
    store: &'a SessionStore,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(store: &'a SessionStore) -> Self {
        Self { store }
    }

    /// Report what a rollback would do without changing anything.
    pub fn preview(&self, id: &str, force: bool) -> Result<RollbackReport> {
        let session = self.store.load(id)?;
        let report = build_report(id, true, force, self.plan(&session)?);
        self.store
            .audit()
            .rollback(id, report.entries.len(), report.forced().count(), true);
        Ok(report)
    }

    /// Restore the session's checkpoint and mark it RolledBack.
    ///
    /// Every pre-image is loaded and verified before the first file is
    /// touched, so a corrupt checkpoint aborts with nothing restored.
    pub fn rollback(&self, id: &str, force: bool) -> Result<RollbackReport> {
        let mut guard = self.store.lock(id)?;
        let plan = self.plan(guard.session())?;

        let conflicted = plan.iter().any(|p| p.entry.is_conflict());
        if conflicted && !force {
            let report = build_report(id, false, force, plan);
            tracing::warn!(session = %id, conflicts = report.conflicts().count(), "rollback refused");
            return Err(CoreError::Conflict(Box::new(report)));
        }

        for planned in &plan {
            restore(planned)?;
        }

        let report = build_report(id, false, force, plan);
        let forced = report.forced().count();
        guard.transition(SessionStatus::RolledBack, None)?;
        self.store
            .audit()
            .rollback(id, report.entries.len(), forced, false);
        tracing::info!(session = %id, restored = report.entries.len(), forced, "rolled back");
        Ok(report)
    }

    fn plan(&self, session: &Session) -> Result<Vec<Planned>> {
        if session.status() != SessionStatus::Executed || session.checkpoint_ref.is_none() {
            return Err(CoreError::NotFound(format!(
                "checkpoint for session {} (status {})",
                session.id,
                session.status()
            )));
        }
        let checkpoint = checkpoint::load(&self.store.checkpoint_manifest(&session.id))?;
        verify_owner(&checkpoint, &session.id)?;
        let blobs = self.store.checkpoint_blobs(&session.id)?;

        let mut plan = Vec::with_capacity(checkpoint.entries.len());
        for (path, entry) in &checkpoint.entries {
            let content = match (&entry.pre_hash, &entry.blob_id) {
                (Some(pre_hash), Some(blob_id)) => {
                    let content = blobs.get(blob_id)?;
                    if &content_hash(&content) != pre_hash {
                        return Err(CoreError::Corrupt {
                            id: blob_id.clone(),
                        });
                    }
                    Some(content)
                }
                (None, _) => None,
                (Some(_), None) => {
                    return Err(CoreError::Corrupt {
                        id: path.display().to_string(),
                    })
                }
            };
            let action = if content.is_some() {
                RollbackAction::Restore
            } else {
                RollbackAction::Delete
            };
            plan.push(Planned {
                entry: RollbackEntry {
                    path: path.clone(),
                    action,
                    current_hash: hash_file(path)?,
                    expected_hash: entry.post_hash.clone(),
                },
                content,
            });
        }
        Ok(plan)
    }
}

fn verify_owner(checkpoint: &Checkpoint, id: &str) -> Result<()> {
    if checkpoint.session_id == id {
        Ok(())
    } else {
        Err(CoreError::Corrupt {
            id: format!("checkpoint of {}", checkpoint.session_id),
        })
    }
}

fn restore(planned: &Planned) -> Result<()> {
    let path: &Path = &planned.entry.path;
    match &planned.content {
        Some(content) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).at(parent)?;
            }
            write_target(path, content)
        }
        None => match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::io(path, e)),
        },
    }
}

fn build_report(id: &str, dry_run: bool, force: bool, plan: Vec<Planned>) -> RollbackReport {
    RollbackReport {
        entries: plan.into_iter().map(|p| p.entry).collect(),
        ..RollbackReport::empty(id, dry_run, force)
    }
}
