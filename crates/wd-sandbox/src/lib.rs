//! Kernel-level confinement for subprocesses launched by warden.
//!
//! Commands that the policy engine allows on the fast path run for real,
//! but under the same constraints as the sandboxed script: read access to
//! the declared roots only, no filesystem writes, no network. Confinement
//! uses Landlock (Linux) or Seatbelt (macOS) and is irreversible once
//! applied, so it is applied in a child process right before exec.
//!
//! # Architecture
//!
//! The controller process stays unconfined. Confined commands run via
//! `warden --sandbox-exec <argv...>`, which:
//! 1. Deserializes the policy from the `__WD_SANDBOX_POLICY` env var
//! 2. Applies the OS sandbox (Landlock or Seatbelt)
//! 3. Execs the requested command
//!
//! # Usage
//!
//! ```no_run
//! use wd_sandbox::{SandboxPolicy, apply};
//!
//! let policy = SandboxPolicy::read_only(&["/usr".into(), "/etc".into()]);
//! apply(&policy).expect("sandbox application failed");
//! // Process can now only read /usr and /etc, and cannot connect anywhere
//! ```

pub mod policy;

#[cfg(target_os = "linux")]
pub mod landlock;

#[cfg(target_os = "macos")]
pub mod seatbelt;

pub use policy::{SandboxPolicy, SANDBOX_ENV_VAR};

use std::os::unix::process::CommandExt;
use std::process::Command;

use thiserror::Error;

/// Command-line flag that routes the `warden` binary into [`exec_sandboxed`].
pub const TRAMPOLINE_FLAG: &str = "--sandbox-exec";

/// Exit code used when confinement cannot be established.
pub const EXIT_SANDBOX_FAILURE: i32 = 126;

/// Prefix of every diagnostic the trampoline writes to stderr.
pub const DIAGNOSTIC_PREFIX: &str = "[wd:sandbox]";

/// Errors from sandbox application.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Platform-specific sandbox error (Landlock or Seatbelt).
    #[error("sandbox error: {0}")]
    Platform(String),
    /// Policy not found in environment.
    #[error("sandbox error: {SANDBOX_ENV_VAR} env var not set or invalid")]
    NoPolicyInEnv,
    #[error("sandbox policy encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Apply the sandbox to the current process. Irreversible.
///
/// On macOS, uses Seatbelt (`sandbox_init`).
/// On Linux, uses Landlock.
/// On other platforms, returns an error: running unconfined is never a
/// silent fallback.
pub fn apply(policy: &SandboxPolicy) -> Result<(), SandboxError> {
    #[cfg(target_os = "macos")]
    {
        seatbelt::apply_seatbelt(policy)
    }
    #[cfg(target_os = "linux")]
    {
        landlock::apply_landlock(policy)
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = policy;
        Err(SandboxError::Platform(
            "no sandbox implementation for this platform".to_string(),
        ))
    }
}

/// Deserialize policy from env, apply sandbox, exec command. Does not return on success.
///
/// This is the entry point for `warden --sandbox-exec <args...>`.
/// On failure, prints an error to stderr and exits with code 126.
pub fn exec_sandboxed(args: &[String]) -> ! {
    let policy = match SandboxPolicy::from_env() {
        Some(p) => p,
        None => {
            eprintln!("{DIAGNOSTIC_PREFIX} error: {}", SandboxError::NoPolicyInEnv);
            std::process::exit(EXIT_SANDBOX_FAILURE);
        }
    };

    let Some((program, rest)) = args.split_first() else {
        eprintln!("{DIAGNOSTIC_PREFIX} error: no command specified");
        std::process::exit(EXIT_SANDBOX_FAILURE);
    };

    if let Err(e) = apply(&policy) {
        eprintln!("{DIAGNOSTIC_PREFIX} {e}");
        std::process::exit(EXIT_SANDBOX_FAILURE);
    }

    // The policy must not leak into the confined command's environment.
    let err = Command::new(program)
        .args(rest)
        .env_remove(SANDBOX_ENV_VAR)
        .exec();

    eprintln!("{DIAGNOSTIC_PREFIX} exec {program} failed: {err}");
    std::process::exit(EXIT_SANDBOX_FAILURE);
}
