//! Subprocess execution behind a trait seam.
//!
//! Live execs during capture go through [`SandboxedRunner`], which re-enters
//! the `warden` binary via the `--sandbox-exec` trampoline so the command
//! runs under Landlock/Seatbelt. Approved execs at commit go through
//! [`HostRunner`]. Both bound run time and captured output. The capture
//! interpreter itself is launched through the same [`Confinement`].

use std::ffi::OsStr;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;
use wd_protocol::ExecOutput;
use wd_sandbox::{SandboxPolicy, SANDBOX_ENV_VAR, TRAMPOLINE_FLAG};

/// Maximum bytes kept per output stream.
pub const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// Environment variables passed through to child processes.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "TZ"];

pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, io::Result<ExecOutput>>;
}

/// Runs commands directly on the host.
#[derive(Debug, Clone)]
pub struct HostRunner {
    timeout: Duration,
}

impl HostRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for HostRunner {
    fn run<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, io::Result<ExecOutput>> {
        async move {
            let (program, args) = split_argv(argv)?;
            let mut cmd = scrubbed_command(program);
            cmd.args(args);
            run_bounded(cmd, self.timeout).await
        }
        .boxed()
    }
}

/// Launches commands through the `--sandbox-exec` trampoline under a fixed
/// read-only, network-less policy.
#[derive(Debug, Clone)]
pub struct Confinement {
    trampoline: PathBuf,
    policy_json: String,
}

impl Confinement {
    /// Confine to `read_roots` plus system directories, re-entering
    /// `trampoline`.
    pub fn read_only(trampoline: PathBuf, read_roots: &[PathBuf]) -> io::Result<Self> {
        let policy_json = SandboxPolicy::read_only(read_roots)
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Self {
            trampoline,
            policy_json,
        })
    }

    /// `argv` wrapped in the trampoline, with a scrubbed environment plus
    /// the policy.
    pub fn command<S: AsRef<OsStr>>(&self, argv: &[S]) -> io::Result<Command> {
        if argv.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty argv"));
        }
        let mut cmd = scrubbed_command(&self.trampoline);
        cmd.arg(TRAMPOLINE_FLAG)
            .args(argv)
            .env(SANDBOX_ENV_VAR, &self.policy_json);
        Ok(cmd)
    }
}

/// Runs commands confined by a [`Confinement`].
#[derive(Debug, Clone)]
pub struct SandboxedRunner {
    confinement: Confinement,
    timeout: Duration,
}

impl SandboxedRunner {
    pub fn new(confinement: Confinement, timeout: Duration) -> Self {
        Self {
            confinement,
            timeout,
        }
    }
}

impl CommandRunner for SandboxedRunner {
    fn run<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, io::Result<ExecOutput>> {
        async move {
            let cmd = self.confinement.command(argv)?;
            run_bounded(cmd, self.timeout).await
        }
        .boxed()
    }
}

/// Environment handed to child processes: a short allow-list of the
/// parent's variables.
pub fn scrubbed_env() -> Vec<(String, String)> {
    PASSTHROUGH_ENV
        .iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
        .collect()
}

/// A command whose environment is reduced to [`scrubbed_env`].
pub fn scrubbed_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear().envs(scrubbed_env());
    cmd
}

/// Lossy UTF-8 of at most `limit` bytes, with a truncation marker.
pub fn bounded_lossy(bytes: &[u8], limit: usize) -> String {
    if bytes.len() <= limit {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut text = String::from_utf8_lossy(&bytes[..limit]).into_owned();
    text.push_str(&format!("\n[truncated, {} bytes total]", bytes.len()));
    text
}

/// Append `data` to `buf` without letting it grow past `limit` bytes.
pub fn append_bounded(buf: &mut String, data: &str, limit: usize) {
    let room = limit.saturating_sub(buf.len());
    if data.len() <= room {
        buf.push_str(data);
        return;
    }
    let mut cut = room;
    while cut > 0 && !data.is_char_boundary(cut) {
        cut -= 1;
    }
    buf.push_str(&data[..cut]);
}

fn split_argv(argv: &[String]) -> io::Result<(&String, &[String])> {
    argv.split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))
}

async fn run_bounded(mut cmd: Command, timeout: Duration) -> io::Result<ExecOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(ExecOutput {
                code: output.status.code(),
                stdout: bounded_lossy(&output.stdout, MAX_CAPTURE_BYTES),
                stderr: bounded_lossy(&output.stderr, MAX_CAPTURE_BYTES),
                timed_out: false,
            })
        }
        // Dropping the future kills the child.
        Err(_) => Ok(ExecOutput {
            code: None,
            stdout: String::new(),
            stderr: format!("timed out after {}s", timeout.as_secs()),
            timed_out: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[tokio::test]
    async fn host_runner_captures_output() {
        let runner = HostRunner::new(Duration::from_secs(10));
        let out = runner.run(&argv("echo hello")).await.unwrap();
        assert_eq!(out.code, Some(0));
        assert_eq!(out.stdout, "hello\n");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn host_runner_reports_exit_code() {
        let runner = HostRunner::new(Duration::from_secs(10));
        let v = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        assert_eq!(runner.run(&v).await.unwrap().code, Some(3));
    }

    #[tokio::test]
    async fn host_runner_times_out() {
        let runner = HostRunner::new(Duration::from_millis(100));
        let out = runner.run(&argv("sleep 5")).await.unwrap();
        assert!(out.timed_out);
        assert_eq!(out.code, None);
    }

    #[tokio::test]
    async fn missing_binary_is_io_error() {
        let runner = HostRunner::new(Duration::from_secs(1));
        assert!(runner
            .run(&argv("/nonexistent/warden-test-binary"))
            .await
            .is_err());
        assert!(runner.run(&[]).await.is_err());
    }

    #[test]
    fn bounded_lossy_truncates() {
        assert_eq!(bounded_lossy(b"abc", 10), "abc");
        let s = bounded_lossy(b"abcdef", 3);
        assert!(s.starts_with("abc\n[truncated, 6 bytes total]"));
    }

    #[test]
    fn append_bounded_respects_char_boundaries() {
        let mut buf = String::from("ab");
        append_bounded(&mut buf, "cé", 4);
        assert_eq!(buf, "abc");
        append_bounded(&mut buf, "zzz", 4);
        assert_eq!(buf, "abcz");
    }

    #[test]
    fn confined_command_carries_policy_after_scrubbing() {
        let confinement =
            Confinement::read_only(PathBuf::from("/usr/bin/warden"), &[PathBuf::from("/srv")])
                .unwrap();
        let cmd = confinement.command(&argv("df -h")).unwrap();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "/usr/bin/warden");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec![TRAMPOLINE_FLAG, "df", "-h"]);
        let policy = std_cmd
            .get_envs()
            .find(|(k, _)| *k == SANDBOX_ENV_VAR)
            .and_then(|(_, v)| v)
            .unwrap();
        let policy = SandboxPolicy::from_json(policy.to_str().unwrap()).unwrap();
        assert!(policy.readable.contains(&PathBuf::from("/srv")));
        assert!(!policy.allow_network);
        assert!(confinement.command::<String>(&[]).is_err());
    }

    #[test]
    fn scrubbed_env_is_allow_listed() {
        for (k, _) in scrubbed_env() {
            assert!(PASSTHROUGH_ENV.contains(&k.as_str()));
        }
    }
}
