//! What a bot process is allowed to use.
//!
//! A [`SandboxPolicy`] is pure configuration: it says which capabilities are restricted and
//! how much. Enforcement is done by the [`SandboxBackend`](super::SandboxBackend)s of a
//! [`Sandbox`](super::Sandbox) when the bot process is created.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use botctl::sandbox::SandboxPolicyBuilder;
//!
//! let policy = SandboxPolicyBuilder::new()
//!     .with_max_memory(512) // in MB
//!     .with_cpu_time(Duration::from_secs(30))
//!     .with_cpu_list("0-1")
//!     .with_max_open_files(64)
//!     .build()
//!     .unwrap();
//! ```
//!
//! Policies can also be read from environment variables using
//! [`SandboxPolicyBuilder::from_env()`].

use std::{
    collections::BTreeSet,
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};

use super::Capability;

/// Which syscalls a bot may issue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyscallPolicy {
    /// No filtering.
    #[default]
    Unrestricted,
    /// Only the named syscalls are allowed.
    Allowlist(BTreeSet<String>),
}

/// Which parts of the filesystem a bot may touch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FileAccess {
    /// No confinement beyond ordinary permissions.
    #[default]
    Unrestricted,
    /// Only the listed paths (and their descendants) are visible.
    Confined(Vec<PathBuf>),
}

/// Restrictions applied to a bot process before it starts running.
///
/// Obtained with [`SandboxPolicyBuilder`]. The default policy restricts nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SandboxPolicy {
    pub(crate) max_memory: Option<u64>,
    pub(crate) cpu_time: Option<Duration>,
    pub(crate) cpus: Option<BTreeSet<usize>>,
    pub(crate) max_processes: Option<u64>,
    pub(crate) max_open_files: Option<u64>,
    pub(crate) max_file_size: Option<u64>,
    pub(crate) syscalls: SyscallPolicy,
    pub(crate) file_access: FileAccess,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) clear_env: bool,
}

impl SandboxPolicy {
    /// Policy without any restriction.
    pub fn unrestricted() -> SandboxPolicy {
        SandboxPolicy::default()
    }

    /// create a SandboxPolicyBuilder
    pub fn builder() -> SandboxPolicyBuilder {
        SandboxPolicyBuilder::new()
    }

    /// Capabilities this policy restricts, in declaration order.
    pub fn requested(&self) -> Vec<Capability> {
        let mut caps = vec![];
        if self.max_memory.is_some() {
            caps.push(Capability::Memory);
        }
        if self.cpu_time.is_some() {
            caps.push(Capability::CpuTime);
        }
        if self.cpus.is_some() {
            caps.push(Capability::CpuAffinity);
        }
        if self.max_processes.is_some() {
            caps.push(Capability::ProcessCount);
        }
        if self.max_open_files.is_some() {
            caps.push(Capability::OpenFiles);
        }
        if self.max_file_size.is_some() {
            caps.push(Capability::FileSize);
        }
        if self.syscalls != SyscallPolicy::Unrestricted {
            caps.push(Capability::Syscalls);
        }
        if self.file_access != FileAccess::Unrestricted {
            caps.push(Capability::Filesystem);
        }
        caps
    }

    /// Address-space cap in bytes.
    pub fn max_memory(&self) -> Option<u64> {
        self.max_memory
    }

    /// CPU time cap.
    pub fn cpu_time(&self) -> Option<Duration> {
        self.cpu_time
    }

    /// CPUs the bot may run on.
    pub fn cpus(&self) -> Option<&BTreeSet<usize>> {
        self.cpus.as_ref()
    }

    /// Cap on simultaneous processes.
    pub fn max_processes(&self) -> Option<u64> {
        self.max_processes
    }

    /// Cap on open file descriptors.
    pub fn max_open_files(&self) -> Option<u64> {
        self.max_open_files
    }

    /// Cap on the size of files the bot creates, in bytes.
    pub fn max_file_size(&self) -> Option<u64> {
        self.max_file_size
    }

    /// Syscall restriction.
    pub fn syscalls(&self) -> &SyscallPolicy {
        &self.syscalls
    }

    /// Filesystem restriction.
    pub fn file_access(&self) -> &FileAccess {
        &self.file_access
    }

    /// Directory the bot starts in.
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Whether the inherited environment is dropped.
    pub fn clear_env(&self) -> bool {
        self.clear_env
    }
}

/// A builder for [`SandboxPolicy`].
///
/// By default nothing is restricted. Memory sizes are given in MB (1 MB = 1 000 000 bytes).
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use botctl::sandbox::SandboxPolicyBuilder;
///
/// let policy = SandboxPolicyBuilder::new()
///     .with_max_processes(16)
///     .with_max_file_size(10)
///     .with_clear_env(true)
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct SandboxPolicyBuilder {
    max_memory: Option<u64>,
    cpu_time: Option<Duration>,
    cpu_list: Option<String>,
    max_processes: Option<u64>,
    max_open_files: Option<u64>,
    max_file_size: Option<u64>,
    syscalls: SyscallPolicy,
    file_access: FileAccess,
    working_dir: Option<PathBuf>,
    clear_env: bool,
}

impl SandboxPolicyBuilder {
    /// Creates a new `SandboxPolicyBuilder` with no limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `SandboxPolicyBuilder` configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `BOT_MAX_MEMORY_MB` (u64): address-space cap in MB
    /// - `BOT_CPU_TIME_SECS` (u64): CPU time cap in seconds
    /// - `BOT_CPU_LIST` (string): comma-separated list or ranges of CPUs, e.g. "0-3,6"
    /// - `BOT_MAX_PROCESSES` (u64): cap on simultaneous processes
    /// - `BOT_MAX_OPEN_FILES` (u64): cap on open file descriptors
    /// - `BOT_MAX_FILE_SIZE_MB` (u64): cap on created file size in MB
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse_u64 = |var: &str| -> Option<u64> { lookup(var)?.parse().ok() };

        SandboxPolicyBuilder {
            max_memory: parse_u64("BOT_MAX_MEMORY_MB"),
            cpu_time: parse_u64("BOT_CPU_TIME_SECS").map(Duration::from_secs),
            cpu_list: lookup("BOT_CPU_LIST"),
            max_processes: parse_u64("BOT_MAX_PROCESSES"),
            max_open_files: parse_u64("BOT_MAX_OPEN_FILES"),
            max_file_size: parse_u64("BOT_MAX_FILE_SIZE_MB"),
            ..Self::default()
        }
    }

    /// Sets the maximum memory (address space) of the bot, in MB.
    #[must_use]
    pub fn with_max_memory(self, max: u64) -> Self {
        Self {
            max_memory: Some(max),
            ..self
        }
    }

    /// Sets the CPU time the bot may consume over its whole life.
    #[must_use]
    pub fn with_cpu_time(self, duration: Duration) -> Self {
        Self {
            cpu_time: Some(duration),
            ..self
        }
    }

    /// Sets the CPUs the bot may run on.
    ///
    /// Format follows the pattern: `"0-3,6,8"` (inclusive ranges and individual IDs).
    #[must_use]
    pub fn with_cpu_list(self, cpus: &str) -> Self {
        Self {
            cpu_list: Some(cpus.to_string()),
            ..self
        }
    }

    /// Sets the maximum number of simultaneous processes.
    #[must_use]
    pub fn with_max_processes(self, max: u64) -> Self {
        Self {
            max_processes: Some(max),
            ..self
        }
    }

    /// Sets the maximum number of open file descriptors.
    #[must_use]
    pub fn with_max_open_files(self, max: u64) -> Self {
        Self {
            max_open_files: Some(max),
            ..self
        }
    }

    /// Sets the maximum size of files the bot writes, in MB.
    #[must_use]
    pub fn with_max_file_size(self, max: u64) -> Self {
        Self {
            max_file_size: Some(max),
            ..self
        }
    }

    /// Restricts the bot to the given syscalls.
    #[must_use]
    pub fn with_syscall_allowlist<I, S>(self, syscalls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            syscalls: SyscallPolicy::Allowlist(syscalls.into_iter().map(Into::into).collect()),
            ..self
        }
    }

    /// Confines the bot to the given paths.
    #[must_use]
    pub fn with_confined_paths<I, P>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            file_access: FileAccess::Confined(paths.into_iter().map(Into::into).collect()),
            ..self
        }
    }

    /// Sets the directory the bot starts in.
    #[must_use]
    pub fn with_working_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
            ..self
        }
    }

    /// Drop the engine environment variables before starting the bot.
    #[must_use]
    pub fn with_clear_env(self, value: bool) -> Self {
        Self {
            clear_env: value,
            ..self
        }
    }

    /// Consumes the builder and returns the constructed `SandboxPolicy`.
    ///
    /// # Errors
    ///
    /// Returns an error when the policy is impossible on this host: memory cap of zero or
    /// above the total RAM, zero CPU time, unknown CPU ids, or a working directory that
    /// does not exist.
    pub fn build(self) -> anyhow::Result<SandboxPolicy> {
        let max_memory = match self.max_memory {
            Some(0) => bail!("memory cap must be positive"),
            Some(mb) => {
                let mut sys = sysinfo::System::new();
                sys.refresh_memory();
                let bytes = mb.saturating_mul(1_000_000);
                if bytes > sys.total_memory() {
                    bail!(
                        "Bot memory cap ({mb}MB) is greater than total RAM ({}MB)",
                        sys.total_memory() / 1_000_000
                    );
                }
                Some(bytes)
            }
            None => None,
        };

        if self.cpu_time == Some(Duration::ZERO) {
            bail!("CPU time cap must be positive");
        }

        let cpus = match self.cpu_list {
            Some(list) => {
                let cpus = cpu_list_to_set(&list, num_cpus::get())
                    .context("error parsing cpu list")?;
                Some(cpus)
            }
            None => None,
        };

        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                bail!("working directory '{}' is not a directory", dir.display());
            }
        }

        Ok(SandboxPolicy {
            max_memory,
            cpu_time: self.cpu_time,
            cpus,
            max_processes: self.max_processes,
            max_open_files: self.max_open_files,
            max_file_size: self.max_file_size.map(|mb| mb.saturating_mul(1_000_000)),
            syscalls: self.syscalls,
            file_access: self.file_access,
            working_dir: self.working_dir,
            clear_env: self.clear_env,
        })
    }
}

/// Parses `s`, rejecting any cpu id not below `available` before a range is expanded.
fn cpu_list_to_set(s: &str, available: usize) -> anyhow::Result<BTreeSet<usize>> {
    if s.is_empty() {
        bail!("Empty string");
    }
    let mut set = BTreeSet::new();
    for item in s.split(',') {
        let parse = |value: &str| -> anyhow::Result<usize> {
            let cpu: usize = value
                .trim()
                .parse()
                .with_context(|| format!("could not parse {value}"))?;
            if cpu >= available {
                bail!("cpu {cpu} does not exist (this host has {available} logical cpus)");
            }
            Ok(cpu)
        };
        let bounds: Vec<&str> = item.split('-').collect();
        match bounds.as_slice() {
            [value] => {
                set.insert(parse(value)?);
            }
            [start, end] => {
                let (start, end) = (parse(start)?, parse(end)?);
                set.extend(start.min(end)..=start.max(end));
            }
            _ => bail!(
                "each comma-separated item must be a number or a range (e.g. '0-3'), got '{item}'"
            ),
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn cpu_lists() {
        let set = cpu_list_to_set("0-2,5,4-3", 8).unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
        assert!(cpu_list_to_set("", 8).is_err());
        assert!(cpu_list_to_set("1-2-3", 8).is_err());
        assert!(cpu_list_to_set("a", 8).is_err());
        assert!(cpu_list_to_set("8", 8).is_err());
        assert!(cpu_list_to_set("7-8", 8).is_err());
    }

    #[test]
    fn huge_cpu_range_is_rejected_without_expanding() {
        assert!(cpu_list_to_set("0-30000000", 8).is_err());
        assert!(cpu_list_to_set("30000000-0", 8).is_err());

        let start = std::time::Instant::now();
        assert!(SandboxPolicyBuilder::new()
            .with_cpu_list("0-30000000")
            .build()
            .is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn default_policy_requests_nothing() {
        let policy = SandboxPolicyBuilder::new().build().unwrap();
        assert_eq!(policy, SandboxPolicy::unrestricted());
        assert!(policy.requested().is_empty());
    }

    #[test]
    fn requested_capabilities() {
        let policy = SandboxPolicyBuilder::new()
            .with_max_memory(64)
            .with_max_open_files(32)
            .with_syscall_allowlist(["read", "write"])
            .with_confined_paths(["/tmp"])
            .build()
            .unwrap();
        assert_eq!(
            policy.requested(),
            vec![
                Capability::Memory,
                Capability::OpenFiles,
                Capability::Syscalls,
                Capability::Filesystem
            ]
        );
        assert_eq!(policy.max_memory(), Some(64_000_000));
    }

    #[test]
    fn impossible_policies_are_rejected() {
        assert!(SandboxPolicyBuilder::new().with_max_memory(0).build().is_err());
        assert!(SandboxPolicyBuilder::new()
            .with_max_memory(u64::MAX / 1_000_000)
            .build()
            .is_err());
        assert!(SandboxPolicyBuilder::new()
            .with_cpu_time(Duration::ZERO)
            .build()
            .is_err());
        assert!(SandboxPolicyBuilder::new()
            .with_cpu_list("100000")
            .build()
            .is_err());
        assert!(SandboxPolicyBuilder::new()
            .with_working_dir("/definitely/not/here")
            .build()
            .is_err());
    }

    #[test]
    fn environment_lookup() {
        let vars: HashMap<&str, &str> = [
            ("BOT_MAX_MEMORY_MB", "128"),
            ("BOT_CPU_TIME_SECS", "3"),
            ("BOT_CPU_LIST", "0"),
            ("BOT_MAX_PROCESSES", "oops"),
        ]
        .into_iter()
        .collect();
        let policy = SandboxPolicyBuilder::from_lookup(|var| vars.get(var).map(|v| v.to_string()))
            .build()
            .unwrap();

        assert_eq!(policy.max_memory(), Some(128_000_000));
        assert_eq!(policy.cpu_time(), Some(Duration::from_secs(3)));
        assert_eq!(policy.cpus().map(|c| c.len()), Some(1));
        assert_eq!(policy.max_processes(), None);
    }
}
