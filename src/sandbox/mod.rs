//! Enforcement of [`SandboxPolicy`] at process creation.
//!
//! A [`Sandbox`] is a set of [`SandboxBackend`]s. Before a bot is spawned, every backend gets
//! the chance to register restrictions on the [`Command`]; these run in the child between
//! `fork` and `exec`, so the bot never executes unrestricted. A capability requested by the
//! policy that no backend enforces makes the launch fail, unless uncontained execution was
//! explicitly allowed.
//!
//! Built-in backends:
//! - [`RlimitBackend`]: resource limits and CPU affinity (Linux)
//! - [`CgroupBackend`]: one cgroup v2 per bot (Linux only)
//!
//! Syscall filters and filesystem confinement are part of the policy vocabulary, but need a
//! platform backend registered with [`Sandbox::with_backend`].

use std::{fmt, process::Command, time::Duration};

use anyhow::bail;
use tracing::warn;

#[cfg(target_os = "linux")]
mod cgroup_linux;
#[cfg(target_os = "linux")]
pub use cgroup_linux::CgroupBackend;

#[cfg(not(target_os = "linux"))]
mod cgroup_stub;
#[cfg(not(target_os = "linux"))]
pub use cgroup_stub::CgroupBackend;

mod policy;
mod rlimit;

pub use policy::{FileAccess, SandboxPolicy, SandboxPolicyBuilder, SyscallPolicy};
pub use rlimit::RlimitBackend;

/// Time allowed to tear down containments when a launch is aborted.
const RELEASE_DURATION: Duration = Duration::from_secs(1);

/// A kind of restriction a policy can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Memory cap.
    Memory,
    /// CPU time cap.
    CpuTime,
    /// Set of CPUs the bot may run on.
    CpuAffinity,
    /// Cap on simultaneous processes.
    ProcessCount,
    /// Cap on open file descriptors.
    OpenFiles,
    /// Cap on written file size.
    FileSize,
    /// Syscall filtering.
    Syscalls,
    /// Filesystem confinement.
    Filesystem,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Memory => "memory",
            Capability::CpuTime => "cpu-time",
            Capability::CpuAffinity => "cpu-affinity",
            Capability::ProcessCount => "process-count",
            Capability::OpenFiles => "open-files",
            Capability::FileSize => "file-size",
            Capability::Syscalls => "syscalls",
            Capability::Filesystem => "filesystem",
        };
        f.write_str(name)
    }
}

/// Resources that outlive `exec` and must be torn down after the bot exited.
pub trait Containment: Send + fmt::Debug {
    /// Kill whatever is left inside and free the resource, waiting up to `max_duration`.
    fn release(&mut self, max_duration: Duration) -> anyhow::Result<()>;
}

/// A platform mechanism able to enforce some capabilities.
pub trait SandboxBackend: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// True if this backend enforces `capability` when a policy requests it.
    fn enforces(&self, capability: Capability) -> bool;

    /// Register on `command` the work that restricts the child before `exec`.
    ///
    /// Called once per launch, before spawning. Returns the containment to release once the
    /// bot exited, if the backend allocated one.
    fn prepare(
        &self,
        bot_id: &str,
        policy: &SandboxPolicy,
        command: &mut Command,
    ) -> anyhow::Result<Option<Box<dyn Containment>>>;
}

/// The set of backends applied to every bot.
#[derive(Debug)]
pub struct Sandbox {
    backends: Vec<Box<dyn SandboxBackend>>,
    allow_uncontained: bool,
}

impl Sandbox {
    /// Sandbox without backends. Only working directory and environment are applied.
    pub fn new(allow_uncontained: bool) -> Sandbox {
        Sandbox {
            backends: vec![],
            allow_uncontained,
        }
    }

    /// Add a backend. Backends prepare the child in registration order.
    #[must_use]
    pub fn with_backend(mut self, backend: impl SandboxBackend + 'static) -> Sandbox {
        self.backends.push(Box::new(backend));
        self
    }

    /// Names of the registered backends.
    pub fn backends(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Capabilities requested by `policy` that no backend enforces.
    pub fn unenforced(&self, policy: &SandboxPolicy) -> Vec<Capability> {
        policy
            .requested()
            .into_iter()
            .filter(|cap| !self.backends.iter().any(|b| b.enforces(*cap)))
            .collect()
    }

    /// Restrict `command` according to `policy`.
    ///
    /// # Errors
    ///
    /// Fails when a requested capability cannot be enforced, or a backend failed to prepare,
    /// unless uncontained execution is allowed.
    pub fn apply(
        &self,
        bot_id: &str,
        policy: &SandboxPolicy,
        command: &mut Command,
    ) -> anyhow::Result<Vec<Box<dyn Containment>>> {
        let missing = self.unenforced(policy);
        if !missing.is_empty() {
            let missing = missing
                .iter()
                .map(Capability::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            if !self.allow_uncontained {
                bail!("no sandbox backend enforces: {missing}");
            }
            warn!(bot = bot_id, "running uncontained, not enforced: {missing}");
        }

        if let Some(dir) = policy.working_dir() {
            command.current_dir(dir);
        }
        if policy.clear_env() {
            command.env_clear();
        }

        let mut containments = vec![];
        for backend in &self.backends {
            match backend.prepare(bot_id, policy, command) {
                Ok(Some(containment)) => containments.push(containment),
                Ok(None) => {}
                Err(e) if self.allow_uncontained => {
                    warn!(bot = bot_id, "sandbox backend '{}' skipped: {e:#}", backend.name());
                }
                Err(e) => {
                    release_all(containments);
                    return Err(e.context(format!("sandbox backend '{}' failed", backend.name())));
                }
            }
        }
        Ok(containments)
    }
}

/// Release containments of a launch that did not happen.
pub(crate) fn release_all(containments: Vec<Box<dyn Containment>>) {
    for mut containment in containments {
        if let Err(e) = containment.release(RELEASE_DURATION) {
            warn!("could not release {containment:?}: {e:#}");
        }
    }
}
