//! Sandbox controller: the single decision point for one sandboxed script.
//!
//! [`SandboxController::intercept`] handles one request at a time, in the
//! order the script issues them. It never touches the real filesystem for
//! writes and never forwards a request it does not understand. When a live
//! exec is needed it returns [`Outcome::Run`] and the driver reports the
//! result back through [`SandboxController::complete_run`].

pub mod driver;
pub mod procfs;
pub mod vfs;

use std::io;
use std::time::Duration;

use wd_protocol::{
    display_argv, Endpoint, Errno, ExecOutput, Operation, ProtocolError, Reply, Request,
    StagedContent, Stream,
};

use crate::error::{CoreError, Result};
use crate::policy::{classify, Aggregate, Decision, Profile};
use crate::runner::{append_bounded, MAX_CAPTURE_BYTES};
use crate::session::{ExecRecord, OperationDecision, RunMode, Session};
use crate::store::CaptureHandle;

pub use driver::drive;
pub use vfs::{real_path, Vfs};

/// What the driver must do after a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send this reply.
    Reply(Reply),
    /// Run `argv` in the kernel sandbox, then call `complete_run`.
    Run { sequence: u64, argv: Vec<String> },
    /// The script declared its exit code. Reply `ok` and stop reading.
    Exit(i32),
}

pub struct SandboxController {
    capture: CaptureHandle,
    profile: Profile,
    mode: RunMode,
    vfs: Vfs,
}

impl SandboxController {
    pub fn new(capture: CaptureHandle, profile: Profile, vfs: Vfs) -> Self {
        let mode = capture.session().mode;
        Self {
            capture,
            profile,
            mode,
            vfs,
        }
    }

    pub fn session(&self) -> &Session {
        self.capture.session()
    }

    pub fn id(&self) -> &str {
        self.capture.id()
    }

    /// Handle one request. A protocol error means the script must be
    /// stopped and the session failed.
    pub fn intercept(&mut self, request: Request) -> Result<Outcome> {
        tracing::trace!(session = %self.id(), op = request.name(), "intercept");
        match request {
            Request::Read { path } => {
                let path = self.vfs.resolve(&path)?;
                Ok(Outcome::Reply(self.vfs.read(&path)))
            }
            Request::Stat { path } => {
                let path = self.vfs.resolve(&path)?;
                Ok(Outcome::Reply(self.vfs.stat(&path)))
            }
            Request::ListDir { path } => {
                let path = self.vfs.resolve(&path)?;
                Ok(Outcome::Reply(self.vfs.list_dir(&path)))
            }
            Request::Write {
                path,
                content,
                encoding,
                append,
            } => {
                let lexical = self.vfs.resolve(&path)?;
                let path = real_path(&lexical).map_err(|e| CoreError::io(&lexical, e))?;
                let content = encoding.decode(&content)?;
                let blob_id = self.capture.stage(&content)?;
                let staged = StagedContent {
                    blob_id,
                    size: content.len() as u64,
                    append,
                };
                let op = Operation::write(self.capture.next_sequence(), path.clone(), &content, staged);
                self.capture.record(op)?;
                self.vfs.overlay_write(&path, &content, append);
                Ok(Outcome::Reply(Reply::Ok))
            }
            Request::Exec { argv } => self.exec(argv),
            Request::System { command } => {
                if command.trim().is_empty() {
                    return Err(ProtocolError::EmptyArgv.into());
                }
                self.exec(vec!["/bin/sh".to_string(), "-c".to_string(), command])
            }
            Request::Connect { host, port } => {
                let endpoint = Endpoint { host, port };
                tracing::info!(session = %self.id(), %endpoint, "network attempt blocked");
                self.capture.note_network(endpoint);
                Ok(Outcome::Reply(Reply::error(
                    Errno::ConnectionRefused,
                    "network access is disabled",
                )))
            }
            Request::Output { stream, data } => {
                let session = self.capture.session_mut();
                let buf = match stream {
                    Stream::Stdout => &mut session.stdout,
                    Stream::Stderr => &mut session.stderr,
                };
                append_bounded(buf, &data, MAX_CAPTURE_BYTES);
                Ok(Outcome::Reply(Reply::Ok))
            }
            Request::Exit { code } => {
                self.capture.session_mut().exit_code = Some(code);
                Ok(Outcome::Exit(code))
            }
        }
    }

    fn exec(&mut self, argv: Vec<String>) -> Result<Outcome> {
        if argv.is_empty() || argv[0].is_empty() {
            return Err(ProtocolError::EmptyArgv.into());
        }
        if argv.iter().any(|a| a.contains('\0')) {
            return Err(ProtocolError::BadContent("NUL byte in argv".to_string()).into());
        }

        let sequence = self.capture.next_sequence();
        let op = Operation::exec(sequence, argv.clone());
        let verdict = classify(&op, &self.profile);
        self.capture.record(op)?;

        let outcome = match (self.mode, verdict.decision) {
            (RunMode::DryRun, _) | (RunMode::FastPath, Decision::Review) => {
                Outcome::Reply(Reply::deferred())
            }
            (RunMode::FastPath, Decision::Allow) => Outcome::Run { sequence, argv },
            (RunMode::FastPath, Decision::Deny) => Outcome::Reply(Reply::error(
                Errno::PermissionDenied,
                format!(
                    "denied by policy (pattern {:?})",
                    verdict.pattern.unwrap_or_default()
                ),
            )),
        };
        Ok(outcome)
    }

    /// Report the result of a live exec requested via [`Outcome::Run`].
    pub fn complete_run(
        &mut self,
        sequence: u64,
        argv: &[String],
        result: io::Result<ExecOutput>,
        elapsed: Duration,
    ) -> Reply {
        let (record, reply) = match result {
            Ok(output) => (
                ExecRecord {
                    sequence,
                    code: output.code,
                    timed_out: output.timed_out,
                    stdout: output.stdout.clone(),
                    stderr: output.stderr.clone(),
                },
                Reply::exited(output),
            ),
            Err(e) => (
                ExecRecord {
                    sequence,
                    code: None,
                    timed_out: false,
                    stdout: String::new(),
                    stderr: e.to_string(),
                },
                Reply::error(Errno::Io, format!("exec failed: {e}")),
            ),
        };
        tracing::debug!(session = %self.id(), sequence, code = ?record.code, "live exec finished");
        self.capture
            .note_live_exec(record, &display_argv(argv), elapsed.as_millis() as u64);
        reply
    }

    /// Append interpreter stderr that arrived outside the protocol.
    pub fn append_stderr(&mut self, data: &str) {
        append_bounded(&mut self.capture.session_mut().stderr, data, MAX_CAPTURE_BYTES);
    }

    /// Classify every captured operation and seal the session. `floor` is
    /// the predicted verdict; the result is never less restrictive.
    pub fn finish(mut self, exit_code: Option<i32>, floor: Aggregate) -> Result<Session> {
        let session = self.capture.session_mut();
        if session.exit_code.is_none() {
            session.exit_code = exit_code;
        }
        let decisions: Vec<OperationDecision> = session
            .operations
            .iter()
            .map(|op| OperationDecision::new(op.sequence(), classify(op, &self.profile)))
            .collect();
        let aggregate =
            Aggregate::from_decisions(decisions.iter().map(|d| d.decision)).worst(floor);
        self.capture.seal(decisions, aggregate)
    }

    /// End the capture as Failed, keeping everything recorded so far.
    pub fn fail(self, reason: impl Into<String>) -> Result<Session> {
        self.capture.fail(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::session::{SessionDraft, SessionStatus};
    use crate::store::SessionStore;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};
    use wd_protocol::{Encoding, OperationKind};

    fn controller(mode: RunMode) -> (TempDir, SandboxController, PathBuf) {
        let dir = tempdir().unwrap();
        let script = dir.path().join("job.py");
        fs::write(&script, "pass\n").unwrap();
        let store = SessionStore::open(
            dir.path().join("sessions"),
            chrono::Duration::seconds(3600),
            AuditLogger::noop(),
        )
        .unwrap();
        let capture = store
            .begin(SessionDraft {
                name: "job".into(),
                script_path: script.clone(),
                profile: "test".into(),
                mode,
            })
            .unwrap();
        let profile = Profile::new("test", ["df"], ["rm -rf /"]);
        let vfs = Vfs::new(&[dir.path().to_path_buf()], &script, &["python3".to_string()]);
        (dir, SandboxController::new(capture, profile, vfs), script)
    }

    fn exec(argv: &[&str]) -> Request {
        Request::Exec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn dry_run_defers_every_exec() {
        let (_dir, mut c, _) = controller(RunMode::DryRun);
        for argv in [&["df"][..], &["uptime"], &["rm", "-rf", "/"]] {
            assert_eq!(
                c.intercept(exec(argv)).unwrap(),
                Outcome::Reply(Reply::deferred())
            );
        }
        assert_eq!(c.session().operations.len(), 3);
    }

    #[test]
    fn fast_path_runs_allowed_and_refuses_denied() {
        let (_dir, mut c, _) = controller(RunMode::FastPath);
        assert_eq!(
            c.intercept(exec(&["df", "-h"])).unwrap(),
            Outcome::Run {
                sequence: 0,
                argv: vec!["df".into(), "-h".into()]
            }
        );
        assert_eq!(
            c.intercept(exec(&["uptime"])).unwrap(),
            Outcome::Reply(Reply::deferred())
        );
        assert!(matches!(
            c.intercept(exec(&["rm", "-rf", "/"])).unwrap(),
            Outcome::Reply(Reply::Error {
                errno: Errno::PermissionDenied,
                ..
            })
        ));
    }

    #[test]
    fn completed_run_is_recorded_as_live_exec() {
        let (_dir, mut c, _) = controller(RunMode::FastPath);
        let argv = vec!["df".to_string()];
        c.intercept(exec(&["df"])).unwrap();
        let output = ExecOutput {
            code: Some(0),
            stdout: "Filesystem\n".into(),
            ..Default::default()
        };
        let reply = c.complete_run(0, &argv, Ok(output), Duration::from_millis(5));
        assert!(matches!(reply, Reply::Exited { code: 0, .. }));
        assert_eq!(c.session().live_execs.len(), 1);
    }

    #[test]
    fn writes_are_staged_not_applied() {
        let (dir, mut c, _) = controller(RunMode::DryRun);
        let target = dir.path().join("out.txt");
        let reply = c
            .intercept(Request::Write {
                path: target.display().to_string(),
                content: "hello".into(),
                encoding: Encoding::Utf8,
                append: false,
            })
            .unwrap();
        assert_eq!(reply, Outcome::Reply(Reply::Ok));
        assert!(!target.exists());

        let op = &c.session().operations[0];
        assert_eq!(op.kind(), OperationKind::Write);
        assert_eq!(op.staged().unwrap().size, 5);

        let read = c
            .intercept(Request::Read {
                path: target.display().to_string(),
            })
            .unwrap();
        assert_eq!(read, Outcome::Reply(Reply::data(b"hello")));
    }

    #[test]
    fn system_is_a_shell_exec() {
        let (_dir, mut c, _) = controller(RunMode::DryRun);
        c.intercept(Request::System {
            command: "df -h | head -1".into(),
        })
        .unwrap();
        let argv = c.session().operations[0].target().as_argv().unwrap().to_vec();
        assert_eq!(argv, vec!["/bin/sh", "-c", "df -h | head -1"]);
        assert!(c.intercept(Request::System { command: "  ".into() }).is_err());
    }

    #[test]
    fn malformed_requests_are_protocol_errors() {
        let (_dir, mut c, _) = controller(RunMode::DryRun);
        assert!(c.intercept(exec(&[])).is_err());
        assert!(c.intercept(exec(&["ls", "a\0b"])).is_err());
        assert!(c
            .intercept(Request::Read {
                path: String::new()
            })
            .is_err());
        assert!(c.session().operations.is_empty());
    }

    #[test]
    fn connect_is_refused_and_noted() {
        let (_dir, mut c, _) = controller(RunMode::FastPath);
        let outcome = c
            .intercept(Request::Connect {
                host: "example.com".into(),
                port: 80,
            })
            .unwrap();
        assert!(matches!(
            outcome,
            Outcome::Reply(Reply::Error {
                errno: Errno::ConnectionRefused,
                ..
            })
        ));
        assert_eq!(c.session().network_attempts.len(), 1);
        assert!(c.session().operations.is_empty());
    }

    #[test]
    fn finish_seals_with_worst_of_runtime_and_prediction() {
        let (_dir, mut c, _) = controller(RunMode::DryRun);
        c.intercept(exec(&["df"])).unwrap();
        let session = c.finish(Some(0), Aggregate::Review).unwrap();
        assert_eq!(session.aggregate, Some(Aggregate::Review));
        assert_eq!(session.decisions[0].decision, Decision::Allow);
        assert_eq!(session.status(), SessionStatus::Pending);
        assert!(session.is_sealed());
    }

    #[test]
    fn script_itself_is_readable() {
        let (_dir, mut c, script) = controller(RunMode::DryRun);
        let outcome = c
            .intercept(Request::Read {
                path: script.display().to_string(),
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Reply(Reply::data(b"pass\n")));
    }
}
