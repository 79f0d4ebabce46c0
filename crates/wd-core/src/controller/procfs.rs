//! Synthetic `/proc/self` for the sandboxed script.
//!
//! Reads of `/proc/self` are answered here and never reach the controller's
//! own process entries. The content describes the interpreter as launched:
//! its argv and its scrubbed environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use wd_protocol::PROTOCOL_VERSION;

use crate::runner::scrubbed_env;

/// Pid the script sees for itself.
const SELF_PID: u32 = 2;
const PARENT_PID: u32 = 1;

/// Static snapshot of `/proc/self`, keyed by entry name.
#[derive(Debug, Clone, Default)]
pub struct ProcSelf {
    entries: BTreeMap<&'static str, Vec<u8>>,
}

impl ProcSelf {
    /// Entries for `interpreter` running `script`.
    pub fn new(interpreter: &[String], script: &Path) -> Self {
        let mut argv: Vec<String> = interpreter.to_vec();
        argv.push(script.display().to_string());
        let name = interpreter
            .first()
            .and_then(|p| Path::new(p).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "interpreter".to_string());

        let mut env = scrubbed_env();
        env.push(("WARDEN_PROTOCOL".to_string(), PROTOCOL_VERSION.to_string()));

        let mut entries = BTreeMap::new();
        entries.insert("cmdline", nul_joined(argv.iter().map(String::as_str)));
        entries.insert("comm", format!("{name}\n").into_bytes());
        let pairs: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        entries.insert("environ", nul_joined(pairs.iter().map(String::as_str)));
        entries.insert("status", status(&name).into_bytes());
        Self { entries }
    }

    /// The part of `path` below `/proc/self`, if `path` names this process.
    ///
    /// `/proc/thread-self` and `/proc/<pid>` of the controller itself are
    /// aliases.
    pub fn strip(path: &Path) -> Option<PathBuf> {
        let rest = path.strip_prefix("/proc").ok()?;
        let mut components = rest.components();
        let first = components.next()?.as_os_str().to_str()?.to_string();
        let own_pid = std::process::id().to_string();
        if first == "self" || first == "thread-self" || first == own_pid {
            Some(components.as_path().to_path_buf())
        } else {
            None
        }
    }

    /// Content of the entry `name` directly under `/proc/self`.
    pub fn get(&self, name: &Path) -> Option<&[u8]> {
        let name = name.to_str()?;
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }
}

fn nul_joined<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(part.as_bytes());
        out.push(0);
    }
    out
}

fn status(name: &str) -> String {
    format!(
        "Name:\t{name}\nUmask:\t0022\nState:\tR (running)\nTgid:\t{SELF_PID}\nPid:\t{SELF_PID}\nPPid:\t{PARENT_PID}\nTracerPid:\t0\nThreads:\t1\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc_self() -> ProcSelf {
        ProcSelf::new(&["/bin/sh".to_string()], Path::new("/srv/job.sh"))
    }

    #[test]
    fn cmdline_is_interpreter_plus_script() {
        let p = proc_self();
        assert_eq!(p.get(Path::new("cmdline")).unwrap(), b"/bin/sh\0/srv/job.sh\0");
        assert_eq!(p.get(Path::new("comm")).unwrap(), b"sh\n");
    }

    #[test]
    fn environ_is_scrubbed() {
        let p = proc_self();
        let environ = String::from_utf8(p.get(Path::new("environ")).unwrap().to_vec()).unwrap();
        let keys: Vec<&str> = environ
            .split('\0')
            .filter(|kv| !kv.is_empty())
            .filter_map(|kv| kv.split_once('=').map(|(k, _)| k))
            .collect();
        assert!(keys.contains(&"WARDEN_PROTOCOL"));
        for key in keys {
            assert!(
                key == "WARDEN_PROTOCOL"
                    || ["PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "TZ"].contains(&key),
                "unexpected variable {key}"
            );
        }
    }

    #[test]
    fn aliases_of_self_are_recognised() {
        assert_eq!(
            ProcSelf::strip(Path::new("/proc/self/environ")),
            Some(PathBuf::from("environ"))
        );
        assert_eq!(
            ProcSelf::strip(Path::new("/proc/thread-self")),
            Some(PathBuf::new())
        );
        let own = PathBuf::from(format!("/proc/{}/cmdline", std::process::id()));
        assert_eq!(ProcSelf::strip(&own), Some(PathBuf::from("cmdline")));
        assert_eq!(ProcSelf::strip(Path::new("/proc/meminfo")), None);
        assert_eq!(ProcSelf::strip(Path::new("/etc/self")), None);
    }

    #[test]
    fn unknown_entries_are_absent() {
        assert!(proc_self().get(Path::new("maps")).is_none());
        assert!(proc_self().get(Path::new("fd/0")).is_none());
    }
}
