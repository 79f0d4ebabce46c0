//! Session record and its state machine.
//!
//! A session is one script execution's full audit trail. Status changes go
//! through [`Session::transition`], which enforces the legal edges; the
//! session store is the only caller that persists the result.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use wd_protocol::{Endpoint, Operation};

use crate::error::{CoreError, Result};
use crate::policy::{Aggregate, Classification, Decision};

/// Default time a Pending session stays approvable.
pub const DEFAULT_TTL_SECS: i64 = 3600;

/// Maximum slug length in a session id.
const SLUG_MAX: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Approved,
    Executed,
    RolledBack,
    Expired,
    Rejected,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Approved => "approved",
            SessionStatus::Executed => "executed",
            SessionStatus::RolledBack => "rolled_back",
            SessionStatus::Expired => "expired",
            SessionStatus::Rejected => "rejected",
            SessionStatus::Failed => "failed",
        }
    }

    /// Legal edges of the state machine.
    pub fn can_transition(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Expired)
                | (Pending, Failed)
                | (Approved, Executed)
                | (Approved, Failed)
                | (Executed, RolledBack)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How execs are handled during capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Nothing runs; every exec is deferred.
    #[default]
    DryRun,
    /// Allowed execs run live inside the kernel sandbox.
    FastPath,
}

/// Per-operation classification recorded at seal time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDecision {
    pub sequence: u64,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl OperationDecision {
    pub fn new(sequence: u64, classification: Classification) -> Self {
        Self {
            sequence,
            decision: classification.decision,
            pattern: classification.pattern,
        }
    }
}

/// A blocked connection attempt. Audit only; never replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttempt {
    pub endpoint: Endpoint,
    pub at: DateTime<Utc>,
}

/// Result of an exec that ran, live during capture or at commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRecord {
    pub sequence: u64,
    pub code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

/// Inputs for a new session.
#[derive(Debug, Clone)]
pub struct SessionDraft {
    pub name: String,
    pub script_path: PathBuf,
    pub profile: String,
    pub mode: RunMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub script_path: PathBuf,
    pub profile: String,
    pub mode: RunMode,
    status: SessionStatus,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub decisions: Vec<OperationDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Aggregate>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_ref: Option<String>,
    /// Human-readable reason for terminal states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub network_attempts: Vec<NetworkAttempt>,
    #[serde(default)]
    pub live_execs: Vec<ExecRecord>,
    #[serde(default)]
    pub commit_results: Vec<ExecRecord>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Session {
    pub fn new(draft: SessionDraft, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: new_session_id(&draft.name, now),
            name: draft.name,
            script_path: draft.script_path,
            profile: draft.profile,
            mode: draft.mode,
            status: SessionStatus::Pending,
            operations: Vec::new(),
            decisions: Vec::new(),
            aggregate: None,
            created_at: now,
            expires_at: now + ttl,
            sealed_at: None,
            approved_at: None,
            commit_started_at: None,
            executed_at: None,
            checkpoint_ref: None,
            reason: None,
            network_attempts: Vec::new(),
            live_execs: Vec::new(),
            commit_results: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }

    /// Stored status. Prefer [`Session::effective_status`] for decisions.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Status as observed at `now`: a Pending session past its TTL is Expired.
    pub fn effective_status(&self, now: DateTime<Utc>) -> SessionStatus {
        if self.status == SessionStatus::Pending && now >= self.expires_at {
            SessionStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_at.is_some()
    }

    /// Decision recorded for an operation, if the session is sealed.
    pub fn decision_for(&self, sequence: u64) -> Option<&OperationDecision> {
        self.decisions.iter().find(|d| d.sequence == sequence)
    }

    /// First denied operation and the pattern that denied it.
    pub fn first_denial(&self) -> Option<(&Operation, Option<&str>)> {
        self.decisions
            .iter()
            .find(|d| d.decision == Decision::Deny)
            .and_then(|d| {
                self.operations
                    .iter()
                    .find(|op| op.sequence() == d.sequence)
                    .map(|op| (op, d.pattern.as_deref()))
            })
    }

    /// Apply a status change, enforcing the state machine.
    ///
    /// A Pending session past its TTL is moved to Expired first, so a late
    /// approval fails as `expired -> approved`.
    pub(crate) fn transition(
        &mut self,
        to: SessionStatus,
        now: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<()> {
        self.expire_if_due(now);
        let from = self.status;
        if !from.can_transition(to) {
            return Err(self.invalid(to));
        }
        if to == SessionStatus::Approved
            && (!self.is_sealed() || self.aggregate == Some(Aggregate::Blocked))
        {
            return Err(self.invalid(to));
        }

        match to {
            SessionStatus::Approved => self.approved_at = Some(now),
            SessionStatus::Executed => self.executed_at = Some(now),
            _ => {}
        }
        if reason.is_some() {
            self.reason = reason;
        }
        self.status = to;
        tracing::debug!(session = %self.id, %from, %to, "status changed");
        Ok(())
    }

    /// Persist lazy expiry into the record. Returns true if it changed.
    pub(crate) fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.effective_status(now) == SessionStatus::Expired
            && self.status == SessionStatus::Pending
        {
            self.status = SessionStatus::Expired;
            self.reason = Some("approval window elapsed".to_string());
            true
        } else {
            false
        }
    }

    /// Force Failed regardless of the current edge. Used for crash recovery,
    /// where the stored status no longer reflects reality.
    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.reason = Some(reason.into());
    }

    fn invalid(&self, to: SessionStatus) -> CoreError {
        CoreError::InvalidTransition {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }
}

/// `YYYYMMDD-HHMMSS-<slug>-<4 hex>`: time-sortable and legible.
pub fn new_session_id(name: &str, now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        now.format("%Y%m%d-%H%M%S"),
        slugify(name),
        &suffix[..4]
    )
}

fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.chars() {
        if slug.len() >= SLUG_MAX {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "script".to_string()
    } else {
        slug.to_string()
    }
}
