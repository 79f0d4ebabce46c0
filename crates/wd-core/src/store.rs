//! Durable session storage: one directory per session.
//!
//! ```text
//! <root>/<id>/
//!     session.json        record, replaced atomically
//!     script              copy of the script as captured
//!     operations.jsonl    capture log, one Operation per line
//!     staged/*.blob       full content of captured writes
//!     checkpoint.json     checkpoint manifest (after commit)
//!     checkpoint/*.blob   pre-images
//!     .lock               advisory lock held by the current writer
//! ```
//!
//! Every mutation happens under the per-session exclusive lock. Readers
//! never take the lock; they only test it to tell a live writer from a
//! crashed one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use fs2::FileExt;
use wd_protocol::{Endpoint, Operation};

use crate::audit::AuditLogger;
use crate::blob::BlobStore;
use crate::checkpoint::write_atomic;
use crate::error::{CoreError, IoContext, Result};
use crate::policy::Aggregate;
use crate::session::{
    ExecRecord, NetworkAttempt, OperationDecision, Session, SessionDraft, SessionStatus,
};

const SESSION_FILE: &str = "session.json";
const OPERATIONS_LOG: &str = "operations.jsonl";
const LOCK_FILE: &str = ".lock";
const SCRIPT_COPY: &str = "script";
const STAGED_DIR: &str = "staged";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const CHECKPOINT_DIR: &str = "checkpoint";

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    ttl: Duration,
    audit: AuditLogger,
}

impl SessionStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, ttl: Duration, audit: AuditLogger) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).at(&root)?;
        Ok(Self { root, ttl, audit })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn script_copy(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(SCRIPT_COPY)
    }

    pub fn staged_blobs(&self, id: &str) -> Result<BlobStore> {
        BlobStore::open(self.session_dir(id).join(STAGED_DIR))
    }

    pub fn checkpoint_blobs(&self, id: &str) -> Result<BlobStore> {
        BlobStore::open(self.session_dir(id).join(CHECKPOINT_DIR))
    }

    pub fn checkpoint_manifest(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(CHECKPOINT_FILE)
    }

    /// Start capturing a new session. The returned handle holds the session
    /// lock until it is sealed or failed.
    pub fn begin(&self, draft: SessionDraft) -> Result<CaptureHandle> {
        let session = Session::new(draft, Utc::now(), self.ttl);
        let dir = self.session_dir(&session.id);
        fs::create_dir(&dir).at(&dir)?;
        let lock = acquire(&dir)?.ok_or_else(|| CoreError::Busy(session.id.clone()))?;

        let script = dir.join(SCRIPT_COPY);
        fs::copy(&session.script_path, &script).at(&session.script_path)?;

        let log_path = dir.join(OPERATIONS_LOG);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .at(&log_path)?;
        let staged = BlobStore::open(dir.join(STAGED_DIR))?;

        save(&dir, &session)?;
        self.audit.session_created(&session);
        tracing::info!(session = %session.id, profile = %session.profile, "capture started");

        Ok(CaptureHandle {
            session,
            dir,
            log,
            staged,
            audit: self.audit.clone(),
            _lock: lock,
        })
    }

    /// Read a session as currently observable: TTL expiry and crash
    /// recovery are applied to the returned value but not persisted.
    pub fn load(&self, id: &str) -> Result<Session> {
        let dir = self.existing_dir(id)?;
        let mut session = read_session(&dir)?;
        if !session.is_sealed() || session.status() == SessionStatus::Approved {
            let writer_alive = is_locked(&dir)?;
            recover(&dir, &mut session, writer_alive)?;
        }
        session.expire_if_due(Utc::now());
        Ok(session)
    }

    /// Take the exclusive lock on a session for a mutation. A session held
    /// by another writer yields `Busy`.
    pub fn lock(&self, id: &str) -> Result<SessionGuard> {
        let dir = self.existing_dir(id)?;
        let lock = acquire(&dir)?.ok_or_else(|| CoreError::Busy(id.to_string()))?;
        let mut session = read_session(&dir)?;

        let before = session.status();
        // We hold the lock, so no other writer is alive.
        recover(&dir, &mut session, false)?;
        session.expire_if_due(Utc::now());
        if session.status() != before {
            save(&dir, &session)?;
            self.audit.status_changed(
                &session.id,
                before,
                session.status(),
                session.reason.as_deref(),
            );
        }

        Ok(SessionGuard {
            session,
            dir,
            audit: self.audit.clone(),
            _lock: lock,
        })
    }

    /// All sessions, newest first.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root).at(&self.root)? {
            let entry = entry.at(&self.root)?;
            if !entry.path().join(SESSION_FILE).is_file() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&id) {
                Ok(s) => sessions.push(s),
                Err(e) => tracing::warn!(session = %id, error = %e, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    /// Sessions still awaiting a decision.
    pub fn list_pending(&self) -> Result<Vec<Session>> {
        Ok(self
            .list(None)?
            .into_iter()
            .filter(|s| s.status() == SessionStatus::Pending && s.is_sealed())
            .collect())
    }

    fn existing_dir(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let dir = self.session_dir(id);
        if valid && dir.join(SESSION_FILE).is_file() {
            Ok(dir)
        } else {
            Err(CoreError::NotFound(format!("session {id}")))
        }
    }
}

/// Exclusive access to one session for the duration of a mutation.
pub struct SessionGuard {
    session: Session,
    dir: PathBuf,
    audit: AuditLogger,
    _lock: File,
}

impl SessionGuard {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Apply and persist a status change.
    pub fn transition(&mut self, to: SessionStatus, reason: Option<String>) -> Result<()> {
        let from = self.session.status();
        self.session.transition(to, Utc::now(), reason)?;
        self.save()?;
        self.audit
            .status_changed(&self.session.id, from, to, self.session.reason.as_deref());
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        save(&self.dir, &self.session)
    }

    pub fn into_session(self) -> Session {
        self.session
    }
}

/// Write access to a session while its script is being captured.
pub struct CaptureHandle {
    session: Session,
    dir: PathBuf,
    log: File,
    staged: BlobStore,
    audit: AuditLogger,
    _lock: File,
}

impl CaptureHandle {
    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Sequence number the next recorded operation must carry.
    pub fn next_sequence(&self) -> u64 {
        self.session.operations.len() as u64
    }

    /// Stage full write content, returning its blob id.
    pub fn stage(&self, content: &[u8]) -> Result<String> {
        self.staged.put(content)
    }

    /// Append an operation to the capture log. The line is flushed before
    /// this returns.
    pub fn record(&mut self, op: Operation) -> Result<()> {
        debug_assert_eq!(op.sequence(), self.next_sequence());
        let mut line = serde_json::to_string(&op)?;
        line.push('\n');
        let log_path = self.dir.join(OPERATIONS_LOG);
        self.log.write_all(line.as_bytes()).at(&log_path)?;
        self.log.flush().at(&log_path)?;

        self.audit.operation_captured(&self.session.id, &op);
        tracing::debug!(session = %self.session.id, op = %op.describe(), "operation captured");
        self.session.operations.push(op);
        Ok(())
    }

    pub fn note_network(&mut self, endpoint: Endpoint) {
        self.audit.network_blocked(&self.session.id, &endpoint);
        self.session.network_attempts.push(NetworkAttempt {
            endpoint,
            at: Utc::now(),
        });
    }

    pub fn note_live_exec(&mut self, record: ExecRecord, command: &str, duration_ms: u64) {
        self.audit
            .command_executed(&self.session.id, command, record.code, duration_ms, true);
        self.session.live_execs.push(record);
    }

    /// Freeze the operation list and record the classification.
    pub fn seal(mut self, decisions: Vec<OperationDecision>, aggregate: Aggregate) -> Result<Session> {
        self.session.decisions = decisions;
        self.session.aggregate = Some(aggregate);
        self.session.sealed_at = Some(Utc::now());
        save(&self.dir, &self.session)?;
        self.audit
            .session_sealed(&self.session.id, aggregate, self.session.operations.len());
        tracing::info!(session = %self.session.id, %aggregate, "capture sealed");
        Ok(self.session)
    }

    /// End the capture as Failed. Operations recorded so far are kept.
    pub fn fail(mut self, reason: impl Into<String>) -> Result<Session> {
        let reason = reason.into();
        let from = self.session.status();
        // Unchecked: a capture that outlives the TTL still ends Failed.
        self.session.mark_failed(reason.clone());
        save(&self.dir, &self.session)?;
        self.audit
            .status_changed(&self.session.id, from, SessionStatus::Failed, Some(&reason));
        tracing::warn!(session = %self.session.id, %reason, "capture failed");
        Ok(self.session)
    }
}

// --- Private helpers ---

fn read_session(dir: &Path) -> Result<Session> {
    let path = dir.join(SESSION_FILE);
    let bytes = fs::read(&path).at(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn save(dir: &Path, session: &Session) -> Result<()> {
    let json = serde_json::to_vec_pretty(session)?;
    write_atomic(&dir.join(SESSION_FILE), &json)
}

fn read_operations(dir: &Path) -> Result<Vec<Operation>> {
    let path = dir.join(OPERATIONS_LOG);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::io(&path, e)),
    };
    let mut ops = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.at(&path)?;
        // A torn final line from a crash is dropped.
        match serde_json::from_str(&line) {
            Ok(op) => ops.push(op),
            Err(_) => break,
        }
    }
    Ok(ops)
}

/// Fill in state that only exists outside `session.json` and surface
/// interrupted writers as Failed.
fn recover(dir: &Path, session: &mut Session, writer_alive: bool) -> Result<()> {
    if !session.is_sealed() && session.status() == SessionStatus::Pending {
        session.operations = read_operations(dir)?;
        if !writer_alive {
            session.mark_failed("capture interrupted");
        }
    } else if session.status() == SessionStatus::Approved
        && session.commit_started_at.is_some()
        && !writer_alive
    {
        session.mark_failed("commit interrupted");
    }
    Ok(())
}

/// Try to take the session lock. `None` if another writer holds it.
fn acquire(dir: &Path) -> Result<Option<File>> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .at(&path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(CoreError::io(&path, e)),
    }
}

fn is_locked(dir: &Path) -> Result<bool> {
    // Probing takes and immediately drops the lock.
    Ok(acquire(dir)?.is_none())
}
