use std::{io, os::unix::process::CommandExt, process::Command};

use anyhow::Context;
use nix::libc::rlim_t;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tracing::debug;

use super::{Capability, Containment, SandboxBackend, SandboxPolicy};

/// Resource limits set with `setrlimit` in the child, plus CPU affinity on Linux.
///
/// Core dumps are always disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct RlimitBackend;

impl SandboxBackend for RlimitBackend {
    fn name(&self) -> &'static str {
        "rlimit"
    }

    fn enforces(&self, capability: Capability) -> bool {
        match capability {
            Capability::Memory
            | Capability::CpuTime
            | Capability::ProcessCount
            | Capability::OpenFiles
            | Capability::FileSize => true,
            Capability::CpuAffinity => cfg!(target_os = "linux"),
            Capability::Syscalls | Capability::Filesystem => false,
        }
    }

    fn prepare(
        &self,
        bot_id: &str,
        policy: &SandboxPolicy,
        command: &mut Command,
    ) -> anyhow::Result<Option<Box<dyn Containment>>> {
        let limits = limits_for(policy)?;
        debug!(bot = bot_id, ?limits, "resource limits");

        #[cfg(target_os = "linux")]
        let affinity = match policy.cpus() {
            Some(cpus) => Some(affinity::cpu_set(cpus)?),
            None => None,
        };

        // Safety: the hook only issues setrlimit/sched_setaffinity, no allocation.
        unsafe {
            command.pre_exec(move || {
                for &(resource, value) in &limits {
                    setrlimit(resource, value, value)?;
                }
                #[cfg(target_os = "linux")]
                {
                    if let Some(set) = &affinity {
                        affinity::apply(set)?;
                    }
                }
                Ok::<(), io::Error>(())
            });
        }
        Ok(None)
    }
}

/// Limits as `(resource, value)`, clamped to the engine's own hard limits, which the child
/// could not exceed anyway.
fn limits_for(policy: &SandboxPolicy) -> anyhow::Result<Vec<(Resource, rlim_t)>> {
    let mut wanted: Vec<(Resource, u64)> = vec![(Resource::RLIMIT_CORE, 0)];
    if let Some(bytes) = policy.max_memory() {
        wanted.push((Resource::RLIMIT_AS, bytes));
    }
    if let Some(cpu) = policy.cpu_time() {
        // whole seconds, rounded up
        let secs = cpu.as_secs() + u64::from(cpu.subsec_nanos() > 0);
        wanted.push((Resource::RLIMIT_CPU, secs));
    }
    if let Some(max) = policy.max_processes() {
        wanted.push((Resource::RLIMIT_NPROC, max));
    }
    if let Some(max) = policy.max_open_files() {
        wanted.push((Resource::RLIMIT_NOFILE, max));
    }
    if let Some(bytes) = policy.max_file_size() {
        wanted.push((Resource::RLIMIT_FSIZE, bytes));
    }

    wanted
        .into_iter()
        .map(|(resource, value)| {
            let (_soft, hard) = getrlimit(resource)
                .with_context(|| format!("could not read current {resource:?}"))?;
            Ok((resource, (value as rlim_t).min(hard)))
        })
        .collect()
}

#[cfg(target_os = "linux")]
mod affinity {
    use std::collections::BTreeSet;

    use anyhow::Context;
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    pub(super) fn cpu_set(cpus: &BTreeSet<usize>) -> anyhow::Result<CpuSet> {
        let mut set = CpuSet::new();
        for &cpu in cpus {
            set.set(cpu)
                .with_context(|| format!("cpu {cpu} cannot be part of an affinity set"))?;
        }
        Ok(set)
    }

    pub(super) fn apply(set: &CpuSet) -> nix::Result<()> {
        sched_setaffinity(Pid::from_raw(0), set)
    }
}
