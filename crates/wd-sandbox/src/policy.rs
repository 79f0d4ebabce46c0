use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::SandboxError;

/// Environment variable used to transport sandbox policy to the child process.
pub const SANDBOX_ENV_VAR: &str = "__WD_SANDBOX_POLICY";

/// System locations a confined command needs to load and run at all.
const SYSTEM_READABLE: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc", "/opt", "/proc", "/dev/urandom",
];

/// Confinement policy for a command launched on the fast path.
///
/// Default-deny: any path not listed in `writable` or `readable` is
/// inaccessible, and outbound/inbound network is refused unless
/// `allow_network` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxPolicy {
    /// Paths the child may read and write.
    pub writable: Vec<PathBuf>,
    /// Paths the child may read (but not write).
    pub readable: Vec<PathBuf>,
    /// Paths explicitly denied (overrides readable/writable on platforms that support it).
    pub denied: Vec<PathBuf>,
    /// Permit TCP bind/connect. Off for every policy warden builds itself.
    #[serde(default)]
    pub allow_network: bool,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self::read_only(&[])
    }
}

impl SandboxPolicy {
    /// The fast-path constraint set: `roots` plus system directories are
    /// readable, nothing but `/dev/null` is writable, network is off.
    ///
    /// Credential directories under `$HOME` are always denied.
    pub fn read_only(roots: &[PathBuf]) -> Self {
        let mut readable: Vec<String> = SYSTEM_READABLE.iter().map(|s| s.to_string()).collect();
        if cfg!(target_os = "macos") {
            readable.extend([
                "/System".to_string(),
                "/Library".to_string(),
                "/private/var/db".to_string(),
            ]);
        }
        readable.extend(roots.iter().map(|p| p.display().to_string()));

        Self::from_config(
            &["/dev/null".to_string()],
            &readable,
            &[
                "$HOME/.ssh".to_string(),
                "$HOME/.gnupg".to_string(),
                "$HOME/.aws".to_string(),
            ],
        )
    }

    /// Build a policy from config strings, resolving `$CWD` and `$HOME` placeholders.
    ///
    /// Paths are canonicalized where possible to handle symlinks (e.g., macOS
    /// `/tmp` → `/private/tmp`). Both the original and canonical paths are
    /// included in writable/readable lists to handle either form.
    pub fn from_config(writable: &[String], readable: &[String], denied: &[String]) -> Self {
        Self {
            writable: resolve_and_canonicalize(writable),
            readable: resolve_and_canonicalize(readable),
            denied: denied.iter().map(|s| resolve_path(s)).collect(),
            allow_network: false,
        }
    }

    /// Serialize to JSON for transport via environment variable.
    pub fn to_json(&self) -> Result<String, SandboxError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON (e.g., from environment variable).
    pub fn from_json(json: &str) -> Result<Self, SandboxError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Deserialize from the `__WD_SANDBOX_POLICY` environment variable.
    pub fn from_env() -> Option<Self> {
        env::var(SANDBOX_ENV_VAR)
            .ok()
            .and_then(|json| Self::from_json(&json).ok())
    }
}

/// Resolve paths and include canonical forms for symlink handling.
fn resolve_and_canonicalize(paths: &[String]) -> Vec<PathBuf> {
    let mut result = Vec::new();
    for s in paths {
        let resolved = resolve_path(s);
        if let Ok(canonical) = resolved.canonicalize() {
            if canonical != resolved && !result.contains(&canonical) {
                result.push(canonical);
            }
        }
        if !result.contains(&resolved) {
            result.push(resolved);
        }
    }
    result
}

/// Resolve path placeholders: `$CWD` → current_dir(), `$HOME` → $HOME env var.
fn resolve_path(s: &str) -> PathBuf {
    let home = || {
        env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
    };
    match s {
        "$CWD" => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        "$HOME" => home(),
        other => match other.strip_prefix("$HOME/") {
            Some(rest) => home().join(rest),
            None => PathBuf::from(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_has_no_writable_dirs() {
        let policy = SandboxPolicy::read_only(&[PathBuf::from("/srv/data")]);
        assert_eq!(policy.writable, vec![PathBuf::from("/dev/null")]);
        assert!(!policy.allow_network);
    }

    #[test]
    fn read_only_includes_roots_and_system_dirs() {
        let policy = SandboxPolicy::read_only(&[PathBuf::from("/srv/data")]);
        assert!(policy.readable.contains(&PathBuf::from("/srv/data")));
        assert!(policy.readable.contains(&PathBuf::from("/usr")));
        assert!(policy.readable.contains(&PathBuf::from("/etc")));
    }

    #[test]
    fn read_only_denies_credentials() {
        let policy = SandboxPolicy::read_only(&[]);
        let home = env::var("HOME").unwrap();
        assert!(policy
            .denied
            .contains(&PathBuf::from(format!("{home}/.ssh"))));
    }

    #[test]
    fn json_round_trip() {
        let policy = SandboxPolicy::read_only(&[PathBuf::from("/var/log")]);
        let json = policy.to_json().unwrap();
        let restored = SandboxPolicy::from_json(&json).unwrap();
        assert_eq!(policy, restored);
    }

    #[test]
    fn network_flag_defaults_off_when_absent() {
        let policy =
            SandboxPolicy::from_json(r#"{"writable":[],"readable":["/usr"],"denied":[]}"#).unwrap();
        assert!(!policy.allow_network);
    }

    #[test]
    fn from_config_resolves_placeholders() {
        let policy = SandboxPolicy::from_config(
            &["$CWD".to_string()],
            &["$HOME".to_string()],
            &["$HOME/.ssh".to_string()],
        );
        let cwd = env::current_dir().unwrap();
        let home = env::var("HOME").map(PathBuf::from).unwrap();
        assert!(policy.writable.contains(&cwd));
        assert!(policy.readable.contains(&home));
        assert!(policy.denied.contains(&home.join(".ssh")));
    }
}
