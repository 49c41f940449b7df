use std::process::Command;

use anyhow::bail;

use super::{Capability, Containment, SandboxBackend, SandboxPolicy};

/// Stand-in for the cgroup backend on platforms without cgroups. Enforces nothing.
#[derive(Debug, Default)]
pub struct CgroupBackend;

impl CgroupBackend {
    /// See the Linux backend.
    pub fn new() -> CgroupBackend {
        CgroupBackend
    }
}

impl SandboxBackend for CgroupBackend {
    fn name(&self) -> &'static str {
        "cgroup-v2"
    }

    fn enforces(&self, _capability: Capability) -> bool {
        false
    }

    fn prepare(
        &self,
        _bot_id: &str,
        _policy: &SandboxPolicy,
        _command: &mut Command,
    ) -> anyhow::Result<Option<Box<dyn Containment>>> {
        bail!("cgroups only available on linux")
    }
}
