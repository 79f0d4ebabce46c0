//! Process driver: runs the interpreter and pumps the request/reply loop.
//!
//! The interpreter writes one request per line on stdout and blocks on one
//! reply line on stdin. Anything off-protocol kills the interpreter and
//! fails the session. The interpreter runs under the kernel sandbox, so
//! direct writes and connections fail instead of escaping the capture.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use wd_protocol::{ProtocolError, Reply, Request, MAX_REQUEST_BYTES, PROTOCOL_VERSION};
use wd_sandbox::{DIAGNOSTIC_PREFIX, EXIT_SANDBOX_FAILURE};

use super::{Outcome, SandboxController};
use crate::error::{CoreError, Result};
use crate::policy::Aggregate;
use crate::runner::{bounded_lossy, CommandRunner, Confinement, MAX_CAPTURE_BYTES};
use crate::session::Session;

/// How a capture loop ended, short of a clean exit.
enum Abort {
    Cancelled,
    TimedOut,
    Failed(String),
}

/// Run `script` under `interpreter`, confined, and drive the controller until the
/// script exits, then seal the session with `predicted` as the floor.
///
/// Cancellation and timeouts kill the interpreter and leave the session
/// Failed with every operation captured so far.
pub async fn drive(
    mut controller: SandboxController,
    confinement: &Confinement,
    interpreter: &[String],
    script: &Path,
    runner: &dyn CommandRunner,
    predicted: Aggregate,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<Session> {
    let Some(program) = interpreter.first() else {
        return controller.fail("no interpreter configured");
    };

    let mut argv: Vec<OsString> = interpreter.iter().map(OsString::from).collect();
    argv.push(script.as_os_str().to_owned());
    let mut cmd = match confinement.command(&argv) {
        Ok(cmd) => cmd,
        Err(e) => return controller.fail(format!("failed to confine interpreter: {e}")),
    };
    cmd.env("WARDEN_PROTOCOL", PROTOCOL_VERSION)
        .env("WARDEN_SESSION_ID", controller.id())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = script.parent().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return controller.fail(format!("failed to start interpreter {program}: {e}")),
    };
    tracing::info!(session = %controller.id(), pid = child.id(), "interpreter started");

    let (Some(stdout), Some(stdin), Some(mut stderr)) =
        (child.stdout.take(), child.stdin.take(), child.stderr.take())
    else {
        kill(&mut child).await;
        return controller.fail("interpreter pipes unavailable");
    };

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = (&mut stderr)
            .take(MAX_CAPTURE_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
        // Keep draining so the interpreter never blocks on a full pipe.
        let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
        bounded_lossy(&buf, MAX_CAPTURE_BYTES)
    });

    let mut requests = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_REQUEST_BYTES));
    let mut stdin = Some(stdin);
    let deadline = tokio::time::Instant::now() + timeout;

    let result = pump(
        &mut controller,
        &mut requests,
        &mut stdin,
        runner,
        deadline,
        &cancel,
    )
    .await;
    drop(stdin);

    let status = match result {
        Ok(()) => {
            tokio::select! {
                status = child.wait() => status.ok(),
                _ = cancel.cancelled() => {
                    kill(&mut child).await;
                    return finish_aborted(controller, Abort::Cancelled, stderr_task).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    kill(&mut child).await;
                    return finish_aborted(controller, Abort::TimedOut, stderr_task).await;
                }
            }
        }
        Err(abort) => {
            kill(&mut child).await;
            return finish_aborted(controller, abort, stderr_task).await;
        }
    };

    let stderr_text = stderr_task.await.unwrap_or_default();
    controller.append_stderr(&stderr_text);
    let exit_code = status.and_then(|s| s.code());
    tracing::info!(session = %controller.id(), ?exit_code, "interpreter exited");
    if exit_code == Some(EXIT_SANDBOX_FAILURE) && stderr_text.contains(DIAGNOSTIC_PREFIX) {
        return controller.fail("interpreter could not be started inside the sandbox");
    }
    controller.finish(exit_code, predicted)
}

async fn pump(
    controller: &mut SandboxController,
    requests: &mut FramedRead<tokio::process::ChildStdout, LinesCodec>,
    stdin: &mut Option<ChildStdin>,
    runner: &dyn CommandRunner,
    deadline: tokio::time::Instant,
    cancel: &CancellationToken,
) -> std::result::Result<(), Abort> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(Abort::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(Abort::TimedOut),
            next = requests.next() => next,
        };

        let line = match next {
            None => return Ok(()),
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                return Err(protocol_abort(ProtocolError::Oversized(MAX_REQUEST_BYTES + 1)));
            }
            Some(Err(LinesCodecError::Io(e))) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(protocol_abort(ProtocolError::Malformed(
                    "request is not valid UTF-8".to_string(),
                )));
            }
            Some(Err(LinesCodecError::Io(e))) => {
                return Err(Abort::Failed(format!("reading interpreter output: {e}")));
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = Request::parse(&line).map_err(protocol_abort)?;
        let reply = match controller.intercept(request) {
            Ok(Outcome::Reply(reply)) => reply,
            Ok(Outcome::Exit(_)) => {
                send(stdin, &Reply::Ok).await;
                return Ok(());
            }
            Ok(Outcome::Run { sequence, argv }) => {
                let started = Instant::now();
                let result = tokio::select! {
                    _ = cancel.cancelled() => return Err(Abort::Cancelled),
                    result = runner.run(&argv) => result,
                };
                controller.complete_run(sequence, &argv, result, started.elapsed())
            }
            Err(CoreError::Protocol(e)) => return Err(protocol_abort(e)),
            Err(e) => return Err(Abort::Failed(e.to_string())),
        };
        send(stdin, &reply).await;
    }
}

fn protocol_abort(e: ProtocolError) -> Abort {
    Abort::Failed(format!("protocol error: {e}"))
}

async fn send(stdin: &mut Option<ChildStdin>, reply: &Reply) {
    let Some(pipe) = stdin.as_mut() else {
        return;
    };
    let mut line = reply.to_line();
    line.push('\n');
    let written = async {
        pipe.write_all(line.as_bytes()).await?;
        pipe.flush().await
    }
    .await;
    if let Err(e) = written {
        // The interpreter stopped reading; EOF on its stdout ends the loop.
        tracing::debug!(error = %e, "reply not delivered");
        *stdin = None;
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "interpreter already gone");
    }
}

async fn finish_aborted(
    mut controller: SandboxController,
    abort: Abort,
    stderr_task: tokio::task::JoinHandle<String>,
) -> Result<Session> {
    if let Ok(text) = stderr_task.await {
        controller.append_stderr(&text);
    }
    let reason = match abort {
        Abort::Cancelled => "cancelled".to_string(),
        Abort::TimedOut => "timed out".to_string(),
        Abort::Failed(reason) => reason,
    };
    tracing::warn!(session = %controller.id(), %reason, "capture aborted");
    controller.fail(reason)
}
