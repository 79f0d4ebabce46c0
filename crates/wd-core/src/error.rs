//! Error taxonomy for the approval pipeline.
//!
//! `Protocol` and `Commit` are never recovered from: they force the owning
//! session into `Failed`. `PolicyViolation` and `Conflict` are expected,
//! reportable outcomes.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use wd_protocol::ProtocolError;

use crate::rollback::RollbackReport;
use crate::session::SessionStatus;

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol error from sandboxed process: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("denied by policy: {operation} (pattern {pattern:?})")]
    PolicyViolation { operation: String, pattern: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rollback conflict on {} file(s); re-run with force to overwrite", .0.conflicts().count())]
    Conflict(Box<RollbackReport>),

    #[error("commit failed at operation #{sequence}: {message}")]
    Commit { sequence: u64, message: String },

    #[error("session {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("session {0} is locked by another operation")]
    Busy(String),

    #[error("cancelled")]
    Cancelled,

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("blob {id} failed hash verification")]
    Corrupt { id: String },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for the CLI: 0 success, 1 rollback conflict without
    /// force, 2 missing session or checkpoint, 3 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::Conflict(_) => 1,
            CoreError::NotFound(_) => 2,
            _ => 3,
        }
    }
}

/// Attach a path to an `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| CoreError::io(path, e))
    }
}
