use std::{
    ffi::CString,
    io,
    os::unix::{ffi::OsStringExt, process::CommandExt},
    path::PathBuf,
    process::Command,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use cgroups_rs::{cgroup_builder::CgroupBuilder, Cgroup, MaxValue};
use nix::libc;
use tracing::{debug, warn};

use crate::bot::file_safe;

use super::{Capability, Containment, SandboxBackend, SandboxPolicy};

/// Upper bound on processes in a bot cgroup when the policy does not set one.
const DEFAULT_MAX_PIDS: i64 = 100;

/// One cgroup v2 per bot, below the current user's systemd service.
///
/// The child joins its cgroup before `exec`. Requires cgroup v2 with delegation to the
/// current user.
#[derive(Debug, Default)]
pub struct CgroupBackend {
    counter: AtomicU32,
}

impl CgroupBackend {
    /// Backend creating cgroups under `user.slice/user-<uid>.slice/user@<uid>.service/`.
    pub fn new() -> CgroupBackend {
        CgroupBackend {
            counter: AtomicU32::new(1),
        }
    }
}

fn get_cgroup_path(user_id: u32, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

impl SandboxBackend for CgroupBackend {
    fn name(&self) -> &'static str {
        "cgroup-v2"
    }

    fn enforces(&self, capability: Capability) -> bool {
        matches!(
            capability,
            Capability::Memory | Capability::ProcessCount | Capability::CpuAffinity
        )
    }

    fn prepare(
        &self,
        bot_id: &str,
        policy: &SandboxPolicy,
        command: &mut Command,
    ) -> anyhow::Result<Option<Box<dyn Containment>>> {
        if policy.max_memory().is_none()
            && policy.max_processes().is_none()
            && policy.cpus().is_none()
        {
            return Ok(None);
        }

        let hierarchy = cgroups_rs::hierarchies::auto();
        if !hierarchy.v2() {
            bail!("only the cgroup v2 hierarchy is supported");
        }
        let user_id = nix::unistd::getuid().as_raw();
        // a new cgroup name for each bot process
        let group_name = format!(
            "botctl-{}-{}",
            file_safe(bot_id),
            self.counter.fetch_add(1, Ordering::Relaxed)
        );
        let path = get_cgroup_path(user_id, &group_name);
        let procs: PathBuf = hierarchy.root().join(&path).join("cgroup.procs");
        let procs = CString::new(procs.into_os_string().into_vec())
            .context("cgroup path contains a NUL byte")?;

        let group = create_cgroup(&path, policy, hierarchy).context("could not create cgroup")?;
        debug!(bot = bot_id, cgroup = path, "cgroup created");

        // Safety: the hook only issues open/write/close on a pre-built path.
        unsafe {
            command.pre_exec(move || join_cgroup(&procs));
        }
        Ok(Some(Box::new(BotCgroup {
            group,
            released: false,
        })))
    }
}

/// Create a cgroup at `path` with the limits of `policy`.
///
/// # Errors
///
/// This function will return an error if the cgroup could not be created. This can happen if the parameters are incorrect or if cgroup is not available.
fn create_cgroup(
    path: &str,
    policy: &SandboxPolicy,
    hierarchy: Box<dyn cgroups_rs::Hierarchy>,
) -> anyhow::Result<Cgroup> {
    let mut builder = CgroupBuilder::new(path);
    if let Some(bytes) = policy.max_memory() {
        let bytes = i64::try_from(bytes).context("memory cap too large for a cgroup")?;
        builder = builder.memory().memory_hard_limit(bytes).done();
    }
    let max_pids = match policy.max_processes() {
        Some(max) => i64::try_from(max).unwrap_or(i64::MAX),
        None => DEFAULT_MAX_PIDS,
    };
    builder = builder
        .pid()
        .maximum_number_of_processes(MaxValue::Value(max_pids))
        .done();
    if let Some(cpus) = policy.cpus() {
        let cpus = cpus
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(",");
        builder = builder.cpu().cpus(cpus).done();
    }
    builder.build(hierarchy).context("could not create cgroup")
}

/// Move the calling process into the cgroup whose `cgroup.procs` file is `procs`.
fn join_cgroup(procs: &CString) -> io::Result<()> {
    // Safety: `procs` is a valid C string; the fd is closed on every path.
    unsafe {
        let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // "0" designates the writing process
        let written = libc::write(fd, b"0".as_ptr().cast(), 1);
        let err = io::Error::last_os_error();
        libc::close(fd);
        if written != 1 {
            return Err(err);
        }
    }
    Ok(())
}

#[derive(Debug)]
struct BotCgroup {
    group: Cgroup,
    released: bool,
}

fn wait_for_cleanup(group: &Cgroup, max_duration: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + max_duration;
    while !group.tasks().is_empty() {
        if Instant::now() > deadline {
            bail!("cgroup members still alive after {max_duration:?}");
        }

        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
    Ok(())
}

impl Containment for BotCgroup {
    fn release(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        if self.released {
            return Ok(());
        }
        if !self.group.tasks().is_empty() {
            self.group
                .kill()
                .context("could not kill remaining cgroup members")?;
            wait_for_cleanup(&self.group, max_duration).context("cgroup cleanup timed out")?;
        }
        // at this point every member is gone. Even if the delete fails, it is safe to continue
        self.released = true;
        if let Err(e) = self.group.delete() {
            warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
        }
        Ok(())
    }
}

impl Drop for BotCgroup {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_millis(10);
        if let Err(e) = self.release(CLEANUP_DURATION) {
            warn!("cgroup {} not released on drop: {e:#}", self.group.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_path_is_below_user_service() {
        assert_eq!(
            get_cgroup_path(1000, "botctl-a-1"),
            "user.slice/user-1000.slice/user@1000.service/botctl-a-1"
        );
    }

    #[test]
    fn nothing_to_enforce_allocates_nothing() {
        let backend = CgroupBackend::new();
        let res = backend
            .prepare("a", &SandboxPolicy::unrestricted(), &mut Command::new("true"))
            .unwrap();
        assert!(res.is_none());
    }
}
