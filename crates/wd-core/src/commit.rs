//! Commit executor: applies an Approved session's operations for real.
//!
//! Writes replay the staged content captured during the dry run, each one
//! checkpointed before it lands. Execs that already ran live during capture
//! are skipped; the rest run on the host. Cancellation is honoured only
//! between operations.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use wd_protocol::{display_argv, Operation, OperationKind, StagedContent, Target};

use crate::blob::{content_hash, BlobStore};
use crate::checkpoint::{write_target, CheckpointWriter};
use crate::controller::real_path;
use crate::error::{CoreError, Result};
use crate::runner::CommandRunner;
use crate::session::{ExecRecord, Session, SessionStatus};
use crate::store::{SessionGuard, SessionStore};

/// Value of `checkpoint_ref` once a session has a checkpoint.
pub const CHECKPOINT_REF: &str = "checkpoint.json";

pub struct CommitExecutor<'a> {
    store: &'a SessionStore,
    runner: &'a dyn CommandRunner,
}

impl<'a> CommitExecutor<'a> {
    pub fn new(store: &'a SessionStore, runner: &'a dyn CommandRunner) -> Self {
        Self { store, runner }
    }

    /// Apply every recorded Write and Exec of an Approved session.
    ///
    /// On any failure the session ends Failed with its checkpoint reflecting
    /// everything applied so far.
    pub async fn execute(&self, id: &str, cancel: &CancellationToken) -> Result<Session> {
        let mut guard = self.store.lock(id)?;
        let status = guard.session().status();
        if status != SessionStatus::Approved {
            return Err(CoreError::InvalidTransition {
                id: id.to_string(),
                from: status,
                to: SessionStatus::Executed,
            });
        }

        if let Some((op, pattern)) = guard.session().first_denial() {
            let violation = CoreError::PolicyViolation {
                operation: op.describe(),
                pattern: pattern.unwrap_or_default().to_string(),
            };
            guard.transition(SessionStatus::Failed, Some(violation.to_string()))?;
            return Err(violation);
        }

        guard.session_mut().commit_started_at = Some(Utc::now());
        guard.save()?;
        tracing::info!(session = %id, "commit started");

        let staged = self.store.staged_blobs(id)?;
        let live: HashSet<u64> = guard
            .session()
            .live_execs
            .iter()
            .map(|r| r.sequence)
            .collect();
        let operations = guard.session().operations.clone();
        let mut checkpoint = if operations.iter().any(|op| op.kind() == OperationKind::Write) {
            let writer = CheckpointWriter::create(
                id,
                self.store.checkpoint_manifest(id),
                self.store.checkpoint_blobs(id)?,
                Utc::now(),
            );
            guard.session_mut().checkpoint_ref = Some(CHECKPOINT_REF.to_string());
            guard.save()?;
            Some(writer)
        } else {
            None
        };

        for op in &operations {
            if cancel.is_cancelled() {
                guard.transition(SessionStatus::Failed, Some("cancelled".to_string()))?;
                return Err(CoreError::Cancelled);
            }

            let applied = match (op.kind(), op.target()) {
                (OperationKind::Write, Target::Path(path)) => match checkpoint.as_mut() {
                    Some(writer) => self.apply_write(id, writer, &staged, op, path),
                    None => Ok(()),
                },
                (OperationKind::Exec, Target::Argv(argv)) if !live.contains(&op.sequence()) => {
                    self.apply_exec(&mut guard, op.sequence(), argv).await
                }
                _ => Ok(()),
            };

            if let Err(e) = applied {
                let err = match e {
                    CoreError::Commit { .. } => e,
                    other => CoreError::Commit {
                        sequence: op.sequence(),
                        message: other.to_string(),
                    },
                };
                tracing::warn!(session = %id, error = %err, "commit failed");
                guard.transition(SessionStatus::Failed, Some(err.to_string()))?;
                return Err(err);
            }
        }

        guard.transition(SessionStatus::Executed, None)?;
        tracing::info!(session = %id, operations = operations.len(), "commit finished");
        Ok(guard.into_session())
    }

    fn apply_write(
        &self,
        id: &str,
        writer: &mut CheckpointWriter,
        staged: &BlobStore,
        op: &Operation,
        path: &Path,
    ) -> Result<()> {
        let Some(StagedContent {
            blob_id, append, ..
        }) = op.staged()
        else {
            return Err(commit_error(op, "write has no staged content"));
        };
        let content = staged.get(blob_id)?;
        // Captured targets are real paths; a symlink planted since then
        // would redirect the write away from what was classified.
        let real = real_path(path).map_err(|e| CoreError::io(path, e))?;
        if real != path {
            return Err(commit_error(
                op,
                format!(
                    "{} now resolves to {}; refusing to follow",
                    path.display(),
                    real.display()
                ),
            ));
        }
        if !path.parent().is_some_and(Path::is_dir) {
            return Err(commit_error(
                op,
                format!("{}: parent directory does not exist", path.display()),
            ));
        }

        writer.record_pre(path)?;
        let new_content = if *append {
            let mut existing = match fs::read(path) {
                Ok(c) => c,
                Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(CoreError::io(path, e)),
            };
            existing.extend_from_slice(&content);
            existing
        } else {
            content
        };
        write_target(path, &new_content)?;

        let post_hash = content_hash(&new_content);
        writer.record_post(path, post_hash.clone())?;
        let pre_hash = writer.checkpoint().entries.get(path).and_then(|e| e.pre_hash.clone());
        self.store
            .audit()
            .file_write_applied(id, path, pre_hash.as_deref(), &post_hash);
        tracing::debug!(session = %id, path = %path.display(), "write applied");
        Ok(())
    }

    async fn apply_exec(&self, guard: &mut SessionGuard, sequence: u64, argv: &[String]) -> Result<()> {
        let command = display_argv(argv);
        let started = Instant::now();
        let output = self.runner.run(argv).await.map_err(|e| CoreError::Commit {
            sequence,
            message: format!("{command}: {e}"),
        })?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let id = guard.session().id.clone();
        self.store
            .audit()
            .command_executed(&id, &command, output.code, duration_ms, false);
        let timed_out = output.timed_out;
        guard.session_mut().commit_results.push(ExecRecord {
            sequence,
            code: output.code,
            timed_out,
            stdout: output.stdout,
            stderr: output.stderr,
        });
        guard.save()?;

        if timed_out {
            return Err(CoreError::Commit {
                sequence,
                message: format!("{command}: timed out"),
            });
        }
        Ok(())
    }
}

fn commit_error(op: &Operation, message: impl Into<String>) -> CoreError {
    CoreError::Commit {
        sequence: op.sequence(),
        message: message.into(),
    }
}
