//! Tests for the `--sandbox-exec` trampoline of the `warden` binary.
//!
//! Kernels without Landlock make the trampoline refuse with 126 rather than
//! run unconfined; the tests accept that outcome where confinement itself is
//! what is being exercised.

use std::process::Command;

use wd_sandbox::{SandboxPolicy, EXIT_SANDBOX_FAILURE, SANDBOX_ENV_VAR, TRAMPOLINE_FLAG};

fn warden() -> Command {
    Command::new(env!("CARGO_BIN_EXE_warden"))
}

fn policy_json() -> String {
    SandboxPolicy::read_only(&[]).to_json().unwrap()
}

#[test]
fn missing_policy_exits_126() {
    let output = warden()
        .arg(TRAMPOLINE_FLAG)
        .arg("true")
        .env_remove(SANDBOX_ENV_VAR)
        .output()
        .expect("failed to run warden");

    assert_eq!(
        output.status.code(),
        Some(EXIT_SANDBOX_FAILURE),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn missing_command_exits_126() {
    let output = warden()
        .arg(TRAMPOLINE_FLAG)
        .env(SANDBOX_ENV_VAR, policy_json())
        .output()
        .expect("failed to run warden");

    assert_eq!(output.status.code(), Some(EXIT_SANDBOX_FAILURE));
}

#[cfg(target_os = "linux")]
#[test]
fn confined_command_runs_or_refuses() {
    let output = warden()
        .arg(TRAMPOLINE_FLAG)
        .arg("true")
        .env(SANDBOX_ENV_VAR, policy_json())
        .output()
        .expect("failed to run warden");

    let code = output.status.code();
    assert!(
        code == Some(0) || code == Some(EXIT_SANDBOX_FAILURE),
        "unexpected exit {code:?}, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[cfg(target_os = "linux")]
#[test]
fn confined_command_cannot_write_outside_dev_null() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("escape.txt");

    let output = warden()
        .arg(TRAMPOLINE_FLAG)
        .arg("/bin/sh")
        .arg("-c")
        .arg(format!("echo x > {}", target.display()))
        .env(SANDBOX_ENV_VAR, policy_json())
        .output()
        .expect("failed to run warden");

    assert!(!output.status.success());
    assert!(!target.exists());
}

#[cfg(target_os = "linux")]
#[test]
fn confined_command_cannot_connect() {
    let bash = std::path::Path::new("/bin/bash");
    if !bash.exists() {
        return;
    }
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    let output = warden()
        .arg(TRAMPOLINE_FLAG)
        .arg(bash)
        .arg("-c")
        .arg(format!("exec 3<>/dev/tcp/127.0.0.1/{port}"))
        .env(SANDBOX_ENV_VAR, policy_json())
        .output()
        .expect("failed to run warden");

    assert!(
        !output.status.success(),
        "connect succeeded, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let accepted = listener.accept();
    assert!(
        matches!(&accepted, Err(e) if e.kind() == std::io::ErrorKind::WouldBlock),
        "listener saw a connection"
    );
}

#[test]
fn help_lists_commands() {
    let output = warden().arg("--help").output().expect("failed to run warden");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("warden rollback"));
}
