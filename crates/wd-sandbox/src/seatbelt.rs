//! macOS Seatbelt (sandbox_init) implementation.
//!
//! Generates an SBPL (Sandbox Profile Language) policy string and applies it
//! via the `sandbox_init()` FFI call. Once applied, the sandbox is irreversible.
//!
//! Strategy: allow process plumbing (mach, ipc, signals) broadly, allow
//! file reads only beneath policy paths, deny file writes except for the
//! policy's writable paths, and deny network unless the policy opts in.
//! Sensitive paths (e.g., ~/.ssh) get explicit deny rules for both read and
//! write. In SBPL, more-specific deny rules beat same-specificity allows.

use std::ffi::{CStr, CString};
use std::ptr;

use crate::policy::SandboxPolicy;
use crate::SandboxError;

extern "C" {
    fn sandbox_init(
        profile: *const libc::c_char,
        flags: u64,
        errorbuf: *mut *mut libc::c_char,
    ) -> libc::c_int;

    fn sandbox_free_error(errorbuf: *mut libc::c_char);
}

/// `kSBXProfileString`: interpret the profile parameter as a string.
const SBPL_PROFILE_STRING: u64 = 0;

/// Apply the Seatbelt sandbox to the current process. Irreversible.
pub fn apply_seatbelt(policy: &SandboxPolicy) -> Result<(), SandboxError> {
    let sbpl = generate_sbpl(policy);
    let c_profile = CString::new(sbpl.as_str())
        .map_err(|e| SandboxError::Platform(format!("SBPL contains null byte: {e}")))?;

    let mut errorbuf: *mut libc::c_char = ptr::null_mut();
    let ret = unsafe { sandbox_init(c_profile.as_ptr(), SBPL_PROFILE_STRING, &mut errorbuf) };

    if ret != 0 {
        let msg = if !errorbuf.is_null() {
            let err = unsafe { CStr::from_ptr(errorbuf) }
                .to_string_lossy()
                .into_owned();
            unsafe { sandbox_free_error(errorbuf) };
            err
        } else {
            "unknown sandbox_init error".to_string()
        };
        return Err(SandboxError::Platform(format!(
            "sandbox_init failed: {msg}"
        )));
    }

    Ok(())
}

/// Generate an SBPL (Sandbox Profile Language) string from a SandboxPolicy.
///
/// The profile:
/// 1. Denies everything by default
/// 2. Allows process, mach, ipc, signal and sysctl operations
/// 3. Allows network only when `allow_network` is set
/// 4. Allows file-read* beneath readable and writable paths
/// 5. Allows file-write* beneath writable paths
/// 6. Explicitly denies file-read* and file-write* for sensitive paths
///
/// This gives: read only the declared roots, write nowhere by default.
pub fn generate_sbpl(policy: &SandboxPolicy) -> String {
    let mut sbpl = String::new();

    sbpl.push_str("(version 1)\n");
    sbpl.push_str("(deny default)\n");

    // --- Non-file operations: allow broadly ---
    sbpl.push_str("(allow process*)\n");
    sbpl.push_str("(allow mach*)\n");
    sbpl.push_str("(allow ipc*)\n");
    sbpl.push_str("(allow signal)\n");
    sbpl.push_str("(allow sysctl*)\n");
    if policy.allow_network {
        sbpl.push_str("(allow network*)\n");
    } else {
        sbpl.push_str("(deny network*)\n");
    }

    // --- File reads: dyld needs metadata on every path component ---
    sbpl.push_str("(allow file-read-metadata)\n");
    sbpl.push_str("(allow file-read* (literal \"/\"))\n");
    for path in policy.readable.iter().chain(&policy.writable) {
        let p = path.display();
        sbpl.push_str(&format!("(allow file-read* (subpath \"{p}\"))\n"));
    }

    // --- File writes: only policy writable paths ---
    for path in &policy.writable {
        let p = path.display();
        sbpl.push_str(&format!("(allow file-write* (subpath \"{p}\"))\n"));
    }

    // --- Explicit deny for sensitive paths (read AND write) ---
    // Later, equally specific rules win in SBPL, so these override the grants above.
    for path in &policy.denied {
        let p = path.display();
        sbpl.push_str(&format!("(deny file-read* (subpath \"{p}\"))\n"));
        sbpl.push_str(&format!("(deny file-write* (subpath \"{p}\"))\n"));
    }

    sbpl
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn policy(writable: &[&str], readable: &[&str], denied: &[&str]) -> SandboxPolicy {
        let paths = |v: &[&str]| v.iter().map(PathBuf::from).collect();
        SandboxPolicy {
            writable: paths(writable),
            readable: paths(readable),
            denied: paths(denied),
            allow_network: false,
        }
    }

    #[test]
    fn sbpl_has_deny_default() {
        let sbpl = generate_sbpl(&policy(&[], &[], &[]));
        assert!(sbpl.contains("(version 1)"));
        assert!(sbpl.contains("(deny default)"));
    }

    #[test]
    fn sbpl_denies_network_by_default() {
        let sbpl = generate_sbpl(&policy(&[], &[], &[]));
        assert!(sbpl.contains("(deny network*)"));
        assert!(!sbpl.contains("(allow network*)"));
    }

    #[test]
    fn sbpl_allows_network_when_opted_in() {
        let mut p = policy(&[], &[], &[]);
        p.allow_network = true;
        assert!(generate_sbpl(&p).contains("(allow network*)"));
    }

    #[test]
    fn sbpl_reads_only_declared_roots() {
        let sbpl = generate_sbpl(&policy(&[], &["/usr", "/var/log"], &[]));
        assert!(sbpl.contains("(allow file-read* (subpath \"/usr\"))"));
        assert!(sbpl.contains("(allow file-read* (subpath \"/var/log\"))"));
        assert!(!sbpl.contains("(allow file*)"));
    }

    #[test]
    fn sbpl_writes_only_writable_paths() {
        let sbpl = generate_sbpl(&policy(&["/dev/null"], &["/usr"], &[]));
        assert!(sbpl.contains("(allow file-write* (subpath \"/dev/null\"))"));
        assert!(!sbpl.contains("(allow file-write* (subpath \"/usr\"))"));
    }

    #[test]
    fn sbpl_denies_sensitive_paths() {
        let sbpl = generate_sbpl(&policy(&[], &["/home/user"], &["/home/user/.ssh"]));
        assert!(sbpl.contains("(deny file-read* (subpath \"/home/user/.ssh\"))"));
        assert!(sbpl.contains("(deny file-write* (subpath \"/home/user/.ssh\"))"));
    }
}
