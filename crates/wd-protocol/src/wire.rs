//! Line-delimited JSON protocol between the controller and the sandboxed
//! interpreter.
//!
//! The interpreter writes one [`Request`] per line on its stdout and blocks
//! reading exactly one [`Reply`] line from its stdin before continuing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted request line length in bytes.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Value of `WARDEN_PROTOCOL` passed to the interpreter.
pub const PROTOCOL_VERSION: &str = "jsonl-1";

/// A request from the sandboxed process that the sandbox cannot answer by
/// itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Request {
    Read {
        path: String,
    },
    Stat {
        path: String,
    },
    ListDir {
        path: String,
    },
    Write {
        path: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        encoding: Encoding,
        #[serde(default)]
        append: bool,
    },
    Exec {
        argv: Vec<String>,
    },
    /// Shell command line, as passed to `system(3)`.
    System {
        command: String,
    },
    Connect {
        host: String,
        port: u16,
    },
    Output {
        stream: Stream,
        data: String,
    },
    Exit {
        code: i32,
    },
}

impl Request {
    /// Parse one request line. Anything that is not a well-formed request is
    /// a protocol error.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if line.len() > MAX_REQUEST_BYTES {
            return Err(ProtocolError::Oversized(line.len()));
        }
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Read { .. } => "read",
            Request::Stat { .. } => "stat",
            Request::ListDir { .. } => "list_dir",
            Request::Write { .. } => "write",
            Request::Exec { .. } => "exec",
            Request::System { .. } => "system",
            Request::Connect { .. } => "connect",
            Request::Output { .. } => "output",
            Request::Exit { .. } => "exit",
        }
    }
}

/// Encoding of write content on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Utf8,
    Base64,
}

impl Encoding {
    pub fn decode(&self, content: &str) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Encoding::Utf8 => Ok(content.as_bytes().to_vec()),
            Encoding::Base64 => STANDARD
                .decode(content)
                .map_err(|e| ProtocolError::BadContent(e.to_string())),
        }
    }
}

/// Output stream of the sandboxed script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Error classes reported back to the sandboxed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Errno {
    NotFound,
    PermissionDenied,
    ConnectionRefused,
    InvalidRequest,
    Io,
}

/// Result of running a subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code, `None` when killed by a signal or timed out.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    /// File content, base64-encoded.
    Data {
        content: String,
    },
    Entries {
        names: Vec<String>,
    },
    Metadata {
        size: u64,
        is_dir: bool,
        readonly: bool,
        /// Modification time in seconds since the Unix epoch.
        modified: Option<u64>,
    },
    Exited {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// The command was captured but not run; the script sees success.
    Deferred {
        code: i32,
    },
    Error {
        errno: Errno,
        message: String,
    },
}

impl Reply {
    pub fn data(bytes: &[u8]) -> Self {
        Reply::Data {
            content: STANDARD.encode(bytes),
        }
    }

    pub fn deferred() -> Self {
        Reply::Deferred { code: 0 }
    }

    pub fn error(errno: Errno, message: impl Into<String>) -> Self {
        Reply::Error {
            errno,
            message: message.into(),
        }
    }

    pub fn exited(output: ExecOutput) -> Self {
        Reply::Exited {
            // Signals and timeouts surface as 128+, like a shell would.
            code: output.code.unwrap_or(137),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    /// Serialize as one protocol line (without the trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"error","errno":"io","message":"reply encoding failed"}"#.to_string()
        })
    }
}

/// The sandboxed process sent something outside the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("request too large: {0} bytes")]
    Oversized(usize),
    #[error("invalid path: {0:?}")]
    BadPath(String),
    #[error("invalid content: {0}")]
    BadContent(String),
    #[error("empty argv")]
    EmptyArgv,
}
