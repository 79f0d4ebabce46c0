//! Linux Landlock implementation.
//!
//! Uses the `landlock` crate with ABI V5. Filesystem rights are best effort;
//! the TCP restriction is a hard requirement, so a kernel that cannot deny
//! network access refuses the whole policy. Default-deny for both: only
//! paths listed in the policy are accessible, and no port may be bound or
//! connected to.

use crate::policy::SandboxPolicy;
use crate::{SandboxError, DIAGNOSTIC_PREFIX};

use landlock::{
    Access, AccessFs, AccessNet, CompatLevel, Compatible, PathBeneath, PathFd, Ruleset,
    RulesetAttr, RulesetCreatedAttr, RulesetStatus, ABI,
};

/// Apply Landlock filesystem and network sandbox to the current process. Irreversible.
pub fn apply_landlock(policy: &SandboxPolicy) -> Result<(), SandboxError> {
    let abi = ABI::V5;

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(abi))
        .map_err(|e| SandboxError::Platform(format!("Landlock fs ruleset failed: {e}")))?;

    // Handling net access without adding any NetPort rule denies all TCP
    // bind/connect. Kernels older than ABI V4 cannot, and must fail here.
    if !policy.allow_network {
        ruleset = ruleset
            .set_compatibility(CompatLevel::HardRequirement)
            .handle_access(AccessNet::from_all(abi))
            .map_err(|e| {
                SandboxError::Platform(format!("Landlock cannot deny network access: {e}"))
            })?
            .set_compatibility(CompatLevel::BestEffort);
    }

    let mut ruleset = ruleset
        .create()
        .map_err(|e| SandboxError::Platform(format!("Landlock ruleset create failed: {e}")))?;

    let grants = [
        (&policy.writable, AccessFs::from_all(abi), "writable"),
        (&policy.readable, AccessFs::from_read(abi), "readable"),
    ];

    for (paths, access, label) in grants {
        for path in paths {
            if policy.denied.iter().any(|d| path.starts_with(d)) {
                continue;
            }
            // Paths that don't exist can't be accessed anyway
            let Ok(fd) = PathFd::new(path) else {
                continue;
            };
            ruleset = ruleset
                .add_rule(PathBeneath::new(fd, access))
                .map_err(|e| {
                    SandboxError::Platform(format!(
                        "Landlock add {label} rule for {}: {e}",
                        path.display()
                    ))
                })?;
        }
    }

    // Denied paths are enforced by omission. A denied path nested under a
    // granted path cannot be carved out by Landlock.

    let status = ruleset
        .restrict_self()
        .map_err(|e| SandboxError::Platform(format!("Landlock restrict_self failed: {e}")))?;

    match status.ruleset {
        RulesetStatus::FullyEnforced => Ok(()),
        RulesetStatus::PartiallyEnforced => {
            eprintln!(
                "{DIAGNOSTIC_PREFIX} warning: Landlock filesystem rules partially enforced (kernel may lack full ABI support)"
            );
            Ok(())
        }
        RulesetStatus::NotEnforced => Err(SandboxError::Platform(
            "Landlock not enforced (kernel support missing?)".to_string(),
        )),
    }
}
