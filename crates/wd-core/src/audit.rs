//! Append-only JSONL audit log for session lifecycle events.
//!
//! Writes one JSON object per line, recording session creation, captured
//! operations, blocked connections, sealing, status changes, applied writes,
//! executed commands and rollbacks. Every line carries a `seq` that
//! increases monotonically across all writers of the same file; appends are
//! serialized with an exclusive file lock.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use wd_protocol::{Endpoint, Operation};

use crate::policy::Aggregate;
use crate::session::{Session, SessionStatus};

/// Bytes read from the end of the log to recover the last sequence number.
const TAIL_WINDOW: u64 = 64 * 1024;

/// Append-only JSONL audit logger. Cheap to clone; each event opens,
/// locks, appends and closes the file.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    path: Option<PathBuf>,
}

impl AuditLogger {
    /// Create a logger writing to `path`, creating parent directories.
    pub fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
        })
    }

    /// Create a no-op logger that discards all events.
    pub fn noop() -> Self {
        Self { path: None }
    }

    pub fn session_created(&self, session: &Session) {
        self.write_event(
            &session.id,
            "session_created",
            serde_json::json!({
                "name": session.name,
                "script": session.script_path,
                "profile": session.profile,
                "mode": session.mode,
                "expires_at": session.expires_at,
            }),
        );
    }

    pub fn operation_captured(&self, session_id: &str, op: &Operation) {
        self.write_event(
            session_id,
            "operation_captured",
            serde_json::json!({
                "sequence": op.sequence(),
                "kind": op.kind().as_str(),
                "target": op.target().to_string(),
                "preview": op.payload_preview(),
            }),
        );
    }

    pub fn network_blocked(&self, session_id: &str, endpoint: &Endpoint) {
        self.write_event(
            session_id,
            "network_blocked",
            serde_json::json!({ "endpoint": endpoint.to_string() }),
        );
    }

    pub fn session_sealed(&self, session_id: &str, aggregate: Aggregate, operations: usize) {
        self.write_event(
            session_id,
            "session_sealed",
            serde_json::json!({
                "aggregate": aggregate.as_str(),
                "operations": operations,
            }),
        );
    }

    pub fn status_changed(
        &self,
        session_id: &str,
        from: SessionStatus,
        to: SessionStatus,
        reason: Option<&str>,
    ) {
        self.write_event(
            session_id,
            "status_changed",
            serde_json::json!({
                "from": from.as_str(),
                "to": to.as_str(),
                "reason": reason,
            }),
        );
    }

    pub fn file_write_applied(
        &self,
        session_id: &str,
        path: &Path,
        pre_hash: Option<&str>,
        post_hash: &str,
    ) {
        self.write_event(
            session_id,
            "file_write_applied",
            serde_json::json!({
                "path": path,
                "pre_hash": pre_hash,
                "post_hash": post_hash,
            }),
        );
    }

    /// A command ran, live in the sandbox (`live`) or on the host at commit.
    pub fn command_executed(
        &self,
        session_id: &str,
        command: &str,
        exit_code: Option<i32>,
        duration_ms: u64,
        live: bool,
    ) {
        self.write_event(
            session_id,
            "command_executed",
            serde_json::json!({
                "command": command,
                "exit_code": exit_code,
                "duration_ms": duration_ms,
                "live": live,
            }),
        );
    }

    pub fn rollback(&self, session_id: &str, restored: usize, forced: usize, dry_run: bool) {
        self.write_event(
            session_id,
            "rollback",
            serde_json::json!({
                "restored": restored,
                "forced": forced,
                "dry_run": dry_run,
            }),
        );
    }

    fn write_event(&self, session_id: &str, kind: &str, fields: serde_json::Value) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = append_event(path, session_id, kind, fields) {
            tracing::warn!(path = %path.display(), error = %e, "audit write failed");
        }
    }
}

fn append_event(
    path: &Path,
    session_id: &str,
    kind: &str,
    fields: serde_json::Value,
) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    file.lock_exclusive()?;

    let seq = last_seq(&mut file)?.map_or(0, |s| s + 1);
    let mut event = serde_json::json!({
        "seq": seq,
        "ts": Utc::now().to_rfc3339(),
        "session": session_id,
        "type": kind,
    });
    if let (Some(event), serde_json::Value::Object(extra)) = (event.as_object_mut(), fields) {
        event.extend(extra);
    }

    let mut line = serde_json::to_string(&event)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.flush()
    // Lock released when `file` is dropped.
}

/// Sequence number of the last complete line, if any.
///
/// Only the tail of the log is read. The window may start inside a line or
/// inside a multi-byte character, so the first partial line is skipped and
/// lines are parsed as bytes.
fn last_seq(file: &mut File) -> io::Result<Option<u64>> {
    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::new();
    file.take(TAIL_WINDOW).read_to_end(&mut tail)?;

    let complete = if start > 0 {
        match tail.iter().position(|&b| b == b'\n') {
            Some(i) => &tail[i + 1..],
            None => &[][..],
        }
    } else {
        &tail[..]
    };

    Ok(complete
        .split(|&b| b == b'\n')
        .rev()
        .filter_map(|l| serde_json::from_slice::<serde_json::Value>(l).ok())
        .find_map(|v| v["seq"].as_u64()))
}
