use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};
use crate::policy::Profile;
use crate::session::DEFAULT_TTL_SECS;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Profile used when `run` is not given one.
    pub default_profile: String,
    pub sandbox: SandboxConfig,
    pub session: SessionConfig,
    pub audit: AuditConfig,
    pub approvals: ApprovalsConfig,
    /// User profiles. A user profile shadows a built-in of the same name.
    pub profiles: BTreeMap<String, ProfileConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: "diagnostics".to_string(),
            sandbox: SandboxConfig::default(),
            session: SessionConfig::default(),
            audit: AuditConfig::default(),
            approvals: ApprovalsConfig::default(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter command; the script path is appended as the last argument.
    pub interpreter: Vec<String>,
    /// Directories the script may read during capture. The script itself is
    /// always readable.
    pub read_roots: Vec<String>,
    /// Timeout for any single exec, live or at commit.
    pub exec_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string()],
            read_roots: vec!["/etc".to_string(), "/var/log".to_string()],
            exec_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a Pending session stays approvable.
    pub ttl_secs: i64,
    /// Custom sessions directory. Defaults to ~/.local/share/warden/sessions/.
    pub sessions_dir: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            sessions_dir: None,
        }
    }
}

impl SessionConfig {
    /// Resolve the sessions directory, using the configured path or the XDG default.
    pub fn resolve_sessions_dir(&self) -> PathBuf {
        match self.sessions_dir {
            Some(ref custom) => PathBuf::from(custom),
            None => data_dir().join("sessions"),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Custom audit log path. Defaults to ~/.local/share/warden/audit.jsonl.
    pub path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl AuditConfig {
    /// Resolve the audit log path, using the configured path or the XDG default.
    pub fn resolve_path(&self) -> PathBuf {
        match self.path {
            Some(ref custom) => PathBuf::from(custom),
            None => data_dir().join("audit.jsonl"),
        }
    }
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApprovalsConfig {
    /// Persistent allowlist. Defaults to ~/.config/warden/approved.json.
    pub path: Option<String>,
}

impl ApprovalsConfig {
    pub fn resolve_path(&self) -> PathBuf {
        match self.path {
            Some(ref custom) => PathBuf::from(custom),
            None => config_dir().join("approved.json"),
        }
    }
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProfileConfig {
    pub auto_approve: Vec<String>,
    pub always_deny: Vec<String>,
}

impl Config {
    pub fn load_or_default() -> Self {
        Self::load_from(&config_path())
    }

    /// Load from `path`; a missing or unparsable file yields the defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse config");
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }

    /// Look up a profile: user profiles first, then built-ins.
    pub fn profile(&self, name: &str) -> Result<Profile> {
        if let Some(p) = self.profiles.get(name) {
            return Ok(Profile::new(
                name,
                p.auto_approve.iter().cloned(),
                p.always_deny.iter().cloned(),
            ));
        }
        Profile::builtin(name).ok_or_else(|| CoreError::UnknownProfile(name.to_string()))
    }

    /// Configured read roots with `$HOME` expanded.
    pub fn read_roots(&self) -> Vec<PathBuf> {
        self.sandbox
            .read_roots
            .iter()
            .map(|r| expand_home(r))
            .collect()
    }
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/").or_else(|| raw.strip_prefix("$HOME/")) {
        Some(rest) => home().join(rest),
        None => PathBuf::from(raw),
    }
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local").join("share"));
    base.join("warden")
}

fn config_dir() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"));
    base.join("warden")
}

fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}
