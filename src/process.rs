//! The OS process of one bot.
//!
//! [`BotProcess`] creates the process under a sandbox, delivers control signals to it and
//! reaps it. Every bot runs in its own session, and signals go to its whole process group.
//! Once the exit status has been collected the pid is never used again, since the OS is
//! free to reuse it.

use std::{
    fs::File,
    io,
    os::unix::process::CommandExt,
    process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use anyhow::Context;
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::{setsid, Pid},
};
use tracing::{debug, instrument, trace, warn};

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};

use crate::{
    bot::LaunchDescriptor,
    sandbox::{self, Containment, Sandbox, SandboxPolicy},
};

/// Control signals the engine sends to a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Freeze execution (SIGSTOP).
    Pause,
    /// Resume a paused bot (SIGCONT).
    Continue,
    /// Ask the bot to exit (SIGTERM).
    Terminate,
    /// Kill the bot (SIGKILL).
    Kill,
}

impl From<ControlSignal> for Signal {
    fn from(kind: ControlSignal) -> Signal {
        match kind {
            ControlSignal::Pause => Signal::SIGSTOP,
            ControlSignal::Continue => Signal::SIGCONT,
            ControlSignal::Terminate => Signal::SIGTERM,
            ControlSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// What happened to a control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDelivery {
    /// The signal was sent.
    Delivered,
    /// The process had already exited, nothing was sent.
    AlreadyExited,
    /// The OS refused to deliver the signal.
    Failed(Errno),
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// It exited by itself before termination was requested.
    AlreadyExited,
    /// It exited within the grace period after SIGTERM.
    Terminated,
    /// It had to be killed.
    Killed,
}

/// Exit status of a reaped bot process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Status collected from the OS.
    pub status: ExitStatus,
    /// How the process ended.
    pub cause: ExitCause,
}

impl ExitReport {
    /// True if the bot was gone before the engine asked it to stop.
    pub fn already_exited(&self) -> bool {
        self.cause == ExitCause::AlreadyExited
    }
}

/// A freshly spawned process with the engine ends of its stdin and stdout.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The process itself.
    pub process: BotProcess,
    /// Write end of the bot's stdin.
    pub stdin: ChildStdin,
    /// Read end of the bot's stdout.
    pub stdout: ChildStdout,
}

/// A bot OS process. Killed and reaped on drop.
#[derive(Debug)]
pub struct BotProcess {
    child: Child,
    pgid: Pid,
    exit_status: Option<ExitStatus>,
    containments: Vec<Box<dyn Containment>>,
}

impl BotProcess {
    /// Start the bot described by `launch` under `policy`.
    ///
    /// stdin and stdout are piped to the engine, stderr goes to `stderr`.
    ///
    /// # Errors
    ///
    /// Fails if the sandbox refuses the policy or the program cannot be executed.
    #[instrument(skip_all, fields(bot = launch.id()))]
    pub fn spawn(
        launch: &LaunchDescriptor,
        policy: &SandboxPolicy,
        sandbox: &Sandbox,
        stderr: File,
    ) -> anyhow::Result<SpawnedProcess> {
        let mut command = Command::new(launch.program());
        command
            .args(launch.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr));
        // Safety: setsid is async-signal-safe.
        unsafe {
            command.pre_exec(|| setsid().map(drop).map_err(io::Error::from));
        }

        let containments = sandbox
            .apply(launch.id(), policy, &mut command)
            .context("sandbox policy could not be applied")?;

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                sandbox::release_all(containments);
                return Err(e).with_context(|| {
                    format!("command '{}' could not be started", launch.program().display())
                });
            }
        };
        let pid = child.id();
        let mut process = BotProcess {
            pgid: Pid::from_raw(pid as i32),
            child,
            exit_status: None,
            containments,
        };
        let stdin = process.child.stdin.take().context("bot stdin is not piped")?;
        let stdout = process
            .child
            .stdout
            .take()
            .context("bot stdout is not piped")?;
        debug!(pid, "bot process started");

        Ok(SpawnedProcess {
            process,
            stdin,
            stdout,
        })
    }

    /// OS process id. Meaningless once [`BotProcess::exit_status`] is set.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Exit status, once reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// True while the process has not exited. A paused process is alive.
    ///
    /// An exited process is left unreaped, so its process group id stays reserved until
    /// [`reap`](Self::reap) clears the group.
    pub fn is_alive(&mut self) -> bool {
        !self.leader_exited()
    }

    /// Send `kind` to the bot's process group.
    ///
    /// Never fails: a process that is already gone is reported, with a log entry.
    pub fn signal(&mut self, kind: ControlSignal) -> SignalDelivery {
        if !self.is_alive() {
            debug!(?kind, "bot process already exited, signal dropped");
            return SignalDelivery::AlreadyExited;
        }
        match killpg(self.pgid, Signal::from(kind)) {
            Ok(()) => {
                trace!(?kind, pgid = %self.pgid, "signal delivered");
                SignalDelivery::Delivered
            }
            Err(Errno::ESRCH) => {
                warn!(?kind, pgid = %self.pgid, "bot process group is gone");
                SignalDelivery::AlreadyExited
            }
            Err(errno) => {
                warn!(?kind, pgid = %self.pgid, "signal delivery failed: {errno}");
                SignalDelivery::Failed(errno)
            }
        }
    }

    /// Wait for the process to exit and collect its status.
    ///
    /// Whatever is left in the bot's process group (background children) is killed before the
    /// status is collected. Returns the known status right away if the process was already
    /// reaped.
    pub fn reap(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        self.wait_for_leader()?;
        self.kill_group();
        let status = self.child.wait()?;
        debug!(pid = self.id(), %status, "bot process exited");
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Stop the process and reap it.
    ///
    /// SIGTERM first (a paused bot is continued so it can act on it), SIGKILL once `grace` is
    /// over. The rest of the process group is killed in every case. Containments are released
    /// afterwards.
    #[instrument(skip(self), fields(pid = self.id()))]
    pub fn terminate(&mut self, grace: Duration) -> io::Result<ExitReport> {
        let cause = if !self.is_alive() {
            ExitCause::AlreadyExited
        } else {
            self.signal(ControlSignal::Terminate);
            self.signal(ControlSignal::Continue);
            if self.wait_until(Instant::now() + grace) {
                ExitCause::Terminated
            } else {
                self.kill_group();
                ExitCause::Killed
            }
        };
        let report = ExitReport {
            status: self.reap()?,
            cause,
        };
        debug!(?report, "bot process reaped");
        self.release_containments();
        Ok(report)
    }

    fn wait_until(&mut self, deadline: Instant) -> bool {
        loop {
            if !self.is_alive() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5).min(deadline - now));
        }
    }

    /// SIGKILL to the whole group. Only valid before the leader is reaped.
    fn kill_group(&self) {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => {
                warn!(pgid = %self.pgid, "could not kill bot process group: {errno}")
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    fn leader_exited(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        match waitid(Id::Pid(self.pgid), flags) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(_) => true,
            Err(e) => {
                warn!(pid = self.id(), "could not poll bot process: {e}");
                false
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    fn wait_for_leader(&mut self) -> io::Result<()> {
        loop {
            match waitid(Id::Pid(self.pgid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    // Without WNOWAIT the leader is reaped as soon as it is seen exiting.
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    fn leader_exited(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid = self.id(), "could not poll bot process: {e}");
                false
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    fn wait_for_leader(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn release_containments(&mut self) {
        sandbox::release_all(std::mem::take(&mut self.containments));
    }
}

impl Drop for BotProcess {
    fn drop(&mut self) {
        static DROP_GRACE: Duration = Duration::from_millis(10);
        if self.exit_status.is_none() {
            if let Err(e) = self.terminate(DROP_GRACE) {
                warn!(pid = self.id(), "could not reap bot process on drop: {e}");
            }
        } else {
            self.release_containments();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn spawn_sh(script: &str) -> SpawnedProcess {
        let launch = LaunchDescriptor::new("t", "/bin/sh").with_args(["-c", script]);
        let stderr = tempfile::tempfile().unwrap();
        BotProcess::spawn(
            &launch,
            &SandboxPolicy::unrestricted(),
            &Sandbox::new(false),
            stderr,
        )
        .unwrap()
    }

    #[test]
    fn stdio_is_bound_to_the_pipes() {
        let SpawnedProcess {
            mut process,
            mut stdin,
            mut stdout,
        } = spawn_sh("read -r line; echo \"got $line\"");
        stdin.write_all(b"hi\n").unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "got hi\n");
        assert!(process.reap().unwrap().success());
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let launch = LaunchDescriptor::new("t", "/no/such/bot");
        let res = BotProcess::spawn(
            &launch,
            &SandboxPolicy::unrestricted(),
            &Sandbox::new(false),
            tempfile::tempfile().unwrap(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn terminate_a_running_process() {
        let mut spawned = spawn_sh("sleep 30");
        assert!(spawned.process.is_alive());
        let report = spawned.process.terminate(Duration::from_secs(2)).unwrap();
        assert_eq!(report.cause, ExitCause::Terminated);
        assert!(!spawned.process.is_alive());
    }

    #[test]
    fn terminate_a_paused_process() {
        let mut spawned = spawn_sh("sleep 30");
        assert_eq!(
            spawned.process.signal(ControlSignal::Pause),
            SignalDelivery::Delivered
        );
        // paused is still alive
        assert!(spawned.process.is_alive());
        let report = spawned.process.terminate(Duration::from_secs(2)).unwrap();
        assert_ne!(report.cause, ExitCause::AlreadyExited);
    }

    #[test]
    fn signals_after_exit_are_tolerated() {
        let mut spawned = spawn_sh("exit 3");
        let status = spawned.process.reap().unwrap();
        assert_eq!(status.code(), Some(3));

        assert!(!spawned.process.is_alive());
        assert_eq!(
            spawned.process.signal(ControlSignal::Pause),
            SignalDelivery::AlreadyExited
        );
        assert_eq!(spawned.process.reap().unwrap().code(), Some(3));
        let report = spawned.process.terminate(Duration::ZERO).unwrap();
        assert!(report.already_exited());
        assert_eq!(report.status.code(), Some(3));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reap_kills_what_is_left_of_the_group() {
        let SpawnedProcess {
            mut process,
            stdout,
            ..
        } = spawn_sh("sleep 1234 & echo $!; exit 0");
        let mut line = String::new();
        io::BufRead::read_line(&mut io::BufReader::new(stdout), &mut line).unwrap();
        let stat = format!("/proc/{}/stat", line.trim());

        assert_eq!(process.reap().unwrap().code(), Some(0));
        let start = Instant::now();
        let running = || {
            std::fs::read_to_string(&stat)
                .is_ok_and(|s| !s.rsplit(')').next().unwrap().trim_start().starts_with('Z'))
        };
        while running() && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!running());
    }

    #[test]
    fn control_signals_map_to_posix_signals() {
        assert_eq!(Signal::from(ControlSignal::Pause), Signal::SIGSTOP);
        assert_eq!(Signal::from(ControlSignal::Continue), Signal::SIGCONT);
        assert_eq!(Signal::from(ControlSignal::Terminate), Signal::SIGTERM);
        assert_eq!(Signal::from(ControlSignal::Kill), Signal::SIGKILL);
    }
}
