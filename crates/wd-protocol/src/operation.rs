//! Capturable operations: the vocabulary of side effects a sandboxed script
//! may attempt.
//!
//! Operations are pure data. They are created by the sandbox controller at
//! interception time and never mutated afterwards: fields are private and
//! only exposed through accessors.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Maximum number of content bytes kept in an operation's preview.
pub const PREVIEW_LIMIT: usize = 512;

/// Kind of a captured operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    Exec,
    Network,
    Stat,
}

impl OperationKind {
    /// Machine-readable string for audit logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Exec => "exec",
            OperationKind::Network => "network",
            OperationKind::Stat => "stat",
        }
    }
}

/// Network endpoint a script tried to reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What an operation acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Target {
    /// Absolute, normalized filesystem path (Read/Write/Stat).
    Path(PathBuf),
    /// Argument vector (Exec).
    Argv(Vec<String>),
    /// Remote endpoint (Network).
    Endpoint(Endpoint),
}

impl Target {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Target::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_argv(&self) -> Option<&[String]> {
        match self {
            Target::Argv(argv) => Some(argv),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Path(p) => write!(f, "{}", p.display()),
            Target::Argv(argv) => f.write_str(&display_argv(argv)),
            Target::Endpoint(e) => write!(f, "{e}"),
        }
    }
}

/// Full content of a captured write, staged outside the real filesystem
/// until the owning session is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedContent {
    /// Content-addressed id in the session's staging blob area.
    pub blob_id: String,
    pub size: u64,
    /// Append to the existing file instead of replacing it.
    #[serde(default)]
    pub append: bool,
}

/// One captured side-effecting request from the sandboxed process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    sequence: u64,
    kind: OperationKind,
    target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    staged: Option<StagedContent>,
}

impl Operation {
    /// A write of `content` to `path`. The full content lives in `staged`.
    pub fn write(sequence: u64, path: PathBuf, content: &[u8], staged: StagedContent) -> Self {
        Self {
            sequence,
            kind: OperationKind::Write,
            target: Target::Path(path),
            payload_preview: Some(preview(content)),
            staged: Some(staged),
        }
    }

    /// A subprocess invocation.
    pub fn exec(sequence: u64, argv: Vec<String>) -> Self {
        let line = display_argv(&argv);
        Self {
            sequence,
            kind: OperationKind::Exec,
            target: Target::Argv(argv),
            payload_preview: Some(preview(line.as_bytes())),
            staged: None,
        }
    }

    /// A connection attempt. Always rejected.
    pub fn network(sequence: u64, endpoint: Endpoint) -> Self {
        Self {
            sequence,
            kind: OperationKind::Network,
            target: Target::Endpoint(endpoint),
            payload_preview: None,
            staged: None,
        }
    }

    pub fn read(sequence: u64, path: PathBuf) -> Self {
        Self::path_only(sequence, OperationKind::Read, path)
    }

    pub fn stat(sequence: u64, path: PathBuf) -> Self {
        Self::path_only(sequence, OperationKind::Stat, path)
    }

    fn path_only(sequence: u64, kind: OperationKind, path: PathBuf) -> Self {
        Self {
            sequence,
            kind,
            target: Target::Path(path),
            payload_preview: None,
            staged: None,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn payload_preview(&self) -> Option<&str> {
        self.payload_preview.as_deref()
    }

    pub fn staged(&self) -> Option<&StagedContent> {
        self.staged.as_ref()
    }

    /// One-line human description, e.g. `exec rm -rf /` or `write /tmp/out.txt`.
    pub fn describe(&self) -> String {
        format!("{} {}", self.kind.as_str(), self.target)
    }
}

/// Bounded, lossy UTF-8 preview of content for audit display.
pub fn preview(content: &[u8]) -> String {
    if content.len() <= PREVIEW_LIMIT {
        return String::from_utf8_lossy(content).into_owned();
    }
    let mut text = String::from_utf8_lossy(&content[..PREVIEW_LIMIT]).into_owned();
    // A multi-byte char cut at the limit decodes to U+FFFD; drop it.
    if text.ends_with('\u{FFFD}') {
        text.pop();
    }
    text.push_str(&format!("... [+{} bytes]", content.len() - PREVIEW_LIMIT));
    text
}

/// Render an argv as a shell-like command line for display and matching.
pub fn display_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'') {
                format!("'{}'", arg.replace('\'', "'\\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lexically normalize `raw` against `base`, resolving `.` and `..` without
/// touching the filesystem.
///
/// Returns `None` if the result would not be absolute (relative `raw` with a
/// relative `base`). `..` at the root stays at the root.
pub fn normalize_path(base: &Path, raw: &Path) -> Option<PathBuf> {
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        base.join(raw)
    };
    if !joined.is_absolute() {
        return None;
    }

    let mut out = PathBuf::from("/");
    for component in joined.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}
