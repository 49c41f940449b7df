//! One managed bot: its process, channel, logs and health state.
//!
//! A [`BotSupervisor`] is created by [`BotSupervisor::spawn`] and lives until
//! [`BotSupervisor::shutdown`] (or drop). Transport and process failures are turned into
//! status changes and log entries here; callers only see [`BotStatus`] and [`TurnOutcome`].
//!
//! | from | to | on |
//! |---|---|---|
//! | (start) | Active | handshake before `handshake_timeout` |
//! | (start) | Unresponsive | no handshake, or a wrong one |
//! | (start) | Disqualified | spawn failure |
//! | Active | Unresponsive | move timeout |
//! | Active, Unresponsive | Suspended | [`BotSupervisor::suspend`] |
//! | Suspended | previous status | [`BotSupervisor::resume`] |
//! | Unresponsive | Active | [`BotSupervisor::recover_move`], [`BotSupervisor::retry_handshake`] |
//! | any but Terminated | Disqualified | [`BotSupervisor::disqualify`] |
//! | any | Terminated | [`BotSupervisor::shutdown`], end of output, drop |

use std::{
    fmt,
    path::Path,
    time::{Duration, Instant},
};

use tracing::{debug, info, instrument, warn};

use crate::{
    bot::LaunchDescriptor,
    channel::Channel,
    configuration::Configuration,
    error::{ChannelError, SupervisorError},
    log_sink::BotLogs,
    process::{BotProcess, ControlSignal, ExitReport, SpawnedProcess},
    sandbox::{Sandbox, SandboxPolicy},
};

/// Health of a supervised bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BotStatus {
    /// Handshake done, answering in time.
    Active,
    /// Paused by the engine.
    Suspended,
    /// Missed its handshake or its last move.
    Unresponsive,
    /// Excluded by the engine, or could not be started.
    Disqualified,
    /// Process reaped, everything released. Absorbing.
    Terminated,
}

impl BotStatus {
    /// True if the transition table allows going from `self` to `to`.
    ///
    /// Staying in the same status is not a transition.
    pub fn can_become(self, to: BotStatus) -> bool {
        use BotStatus::*;
        match (self, to) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Disqualified, _) => false,
            (_, Disqualified) => true,
            (Active, Suspended | Unresponsive) => true,
            (Suspended, Active | Unresponsive) => true,
            (Unresponsive, Active | Suspended) => true,
            _ => false,
        }
    }

    /// True for statuses in which the bot no longer plays.
    pub fn is_terminal(self) -> bool {
        matches!(self, BotStatus::Disqualified | BotStatus::Terminated)
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BotStatus::Active => "active",
            BotStatus::Suspended => "suspended",
            BotStatus::Unresponsive => "unresponsive",
            BotStatus::Disqualified => "disqualified",
            BotStatus::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Result of asking a bot for its move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The raw payload the bot sent. It may not be a legal move.
    Move(Vec<u8>),
    /// Nothing before the deadline. The turn is forfeited.
    NoMove,
    /// The bot closed its output. It has been shut down.
    Disconnected,
}

impl TurnOutcome {
    /// The payload, if the bot answered.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            TurnOutcome::Move(payload) => Some(payload),
            _ => None,
        }
    }
}

impl SupervisorError {
    pub(crate) fn not_allowed(status: BotStatus) -> Self {
        match status {
            BotStatus::Terminated => SupervisorError::Terminated,
            BotStatus::Disqualified => SupervisorError::Disqualified,
            other => SupervisorError::NotActive(other),
        }
    }
}

/// A bot process under supervision.
#[derive(Debug)]
pub struct BotSupervisor {
    launch: LaunchDescriptor,
    policy: SandboxPolicy,
    marker: Vec<u8>,
    grace_period: Duration,
    process: Option<BotProcess>,
    channel: Channel,
    logs: Option<BotLogs>,
    status: BotStatus,
    resume_to: BotStatus,
    moves: Vec<Vec<u8>>,
    turn: u64,
    handshake_complete: bool,
    handshake_timed_out: bool,
    stale_output: bool,
    spawn_failure: Option<String>,
    exit_report: Option<ExitReport>,
}

impl BotSupervisor {
    /// Start the bot and wait for its handshake.
    ///
    /// Never fails: a bot that cannot be started is returned [`BotStatus::Disqualified`] with
    /// [`BotSupervisor::spawn_failure`] set, a bot that does not shake hands in time is
    /// [`BotStatus::Unresponsive`].
    #[instrument(skip_all, fields(bot = launch.id()))]
    pub fn spawn(
        launch: LaunchDescriptor,
        policy: SandboxPolicy,
        sandbox: &Sandbox,
        config: &Configuration,
    ) -> BotSupervisor {
        let mut supervisor = BotSupervisor {
            marker: config.handshake_marker().as_bytes().to_vec(),
            grace_period: config.grace_period,
            process: None,
            channel: Channel::closed(config.max_frame_len),
            logs: None,
            status: BotStatus::Unresponsive,
            resume_to: BotStatus::Unresponsive,
            moves: vec![],
            turn: 0,
            handshake_complete: false,
            handshake_timed_out: false,
            stale_output: false,
            spawn_failure: None,
            exit_report: None,
            launch,
            policy,
        };

        if let Err(e) = supervisor.start(sandbox, config) {
            let reason = format!("{e:#}");
            warn!("spawn failure: {reason}");
            if let Some(logs) = supervisor.logs.as_mut() {
                logs.record_disqualification(&format!("spawn failure: {reason}"));
            }
            supervisor.spawn_failure = Some(reason);
            supervisor.status = BotStatus::Disqualified;
            return supervisor;
        }

        let deadline = Instant::now() + supervisor.launch.handshake_timeout();
        match supervisor.await_handshake(deadline) {
            Ok(()) => info!("bot is active"),
            Err(e) => info!(status = %supervisor.status, "handshake failed: {e}"),
        }
        supervisor
    }

    fn start(&mut self, sandbox: &Sandbox, config: &Configuration) -> anyhow::Result<()> {
        let (logs, stderr) = BotLogs::create(config.log_dir(), self.launch.id())?;
        self.logs = Some(logs);
        let SpawnedProcess {
            process,
            stdin,
            stdout,
        } = BotProcess::spawn(&self.launch, &self.policy, sandbox, stderr)?;
        self.process = Some(process);
        self.channel = Channel::new(stdin, stdout, config.max_frame_len)?;
        Ok(())
    }

    /// Wait for the liveness marker until `deadline`.
    fn await_handshake(&mut self, deadline: Instant) -> Result<(), SupervisorError> {
        match self.channel.receive(deadline) {
            Ok(frame) if frame == self.marker => {
                self.handshake_complete = true;
                self.handshake_timed_out = false;
                self.transition(BotStatus::Active)
            }
            Ok(frame) => {
                self.handshake_timed_out = false;
                Err(SupervisorError::HandshakeMismatch(
                    String::from_utf8_lossy(&frame).into_owned(),
                ))
            }
            Err(ChannelError::Timeout) => {
                // a late marker stays queued for retry_handshake
                self.handshake_timed_out = true;
                Err(SupervisorError::HandshakeTimeout)
            }
            Err(ChannelError::Closed) => {
                debug!("bot closed its output before the handshake");
                self.shutdown();
                Err(SupervisorError::Terminated)
            }
            Err(e) => {
                warn!("handshake read failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Wait up to `timeout` more for the handshake. Only possible after the handshake
    /// timed out, while the bot is still [`BotStatus::Unresponsive`].
    #[instrument(skip(self), fields(bot = self.id()))]
    pub fn retry_handshake(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        if self.handshake_complete {
            return Ok(());
        }
        if self.status != BotStatus::Unresponsive || !self.handshake_timed_out {
            return Err(SupervisorError::not_allowed(self.status));
        }
        self.await_handshake(Instant::now() + timeout)
    }

    /// Forward an opaque state payload to the bot.
    ///
    /// Waits only for room in the pipe, for at most the move timeout.
    pub fn update_state(&mut self, payload: &[u8]) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + self.launch.move_timeout();
        self.update_state_until(payload, deadline)
    }

    /// [`update_state`](Self::update_state) bounded by `deadline` instead of the move timeout.
    #[instrument(skip_all, fields(bot = self.id(), len = payload.len()))]
    pub fn update_state_until(
        &mut self,
        payload: &[u8],
        deadline: Instant,
    ) -> Result<(), SupervisorError> {
        if self.status.is_terminal() {
            return Err(SupervisorError::not_allowed(self.status));
        }
        if self.stale_output {
            let dropped = self.channel.discard_pending();
            if dropped > 0 {
                debug!(dropped, "late output discarded");
            }
            self.stale_output = false;
        }
        self.channel.send(payload, deadline).map_err(|e| {
            warn!("state not delivered: {e}");
            SupervisorError::from(e)
        })
    }

    /// Read the bot's move until `deadline`. Requires [`BotStatus::Active`].
    ///
    /// A timeout forfeits the turn and makes the bot [`BotStatus::Unresponsive`].
    #[instrument(skip(self), fields(bot = self.id(), turn = self.turn + 1))]
    pub fn request_move(&mut self, deadline: Instant) -> Result<TurnOutcome, SupervisorError> {
        if self.status != BotStatus::Active {
            return Err(SupervisorError::not_allowed(self.status));
        }
        self.read_move(deadline)
    }

    /// [`BotSupervisor::request_move`] with the bot's own move timeout.
    pub fn next_move(&mut self) -> Result<TurnOutcome, SupervisorError> {
        self.request_move(Instant::now() + self.launch.move_timeout())
    }

    /// Read a move from an [`BotStatus::Unresponsive`] bot, making it Active again if it
    /// answers in time. On an Active bot this is [`BotSupervisor::request_move`].
    #[instrument(skip(self), fields(bot = self.id(), turn = self.turn + 1))]
    pub fn recover_move(&mut self, deadline: Instant) -> Result<TurnOutcome, SupervisorError> {
        match self.status {
            BotStatus::Active => self.read_move(deadline),
            BotStatus::Unresponsive if self.handshake_complete => {
                let outcome = self.read_move(deadline)?;
                if matches!(outcome, TurnOutcome::Move(_)) {
                    self.transition(BotStatus::Active)?;
                    info!("bot recovered");
                }
                Ok(outcome)
            }
            status => Err(SupervisorError::not_allowed(status)),
        }
    }

    fn read_move(&mut self, deadline: Instant) -> Result<TurnOutcome, SupervisorError> {
        self.turn += 1;
        let turn = self.turn;
        match self.channel.receive(deadline) {
            Ok(payload) => {
                debug!(len = payload.len(), "move received");
                if let Some(logs) = self.logs.as_mut() {
                    logs.record_move(turn, &payload);
                }
                self.moves.push(payload.clone());
                Ok(TurnOutcome::Move(payload))
            }
            Err(ChannelError::Timeout) => {
                info!("no move before the deadline, turn forfeited");
                if let Some(logs) = self.logs.as_mut() {
                    logs.record_forfeit(turn);
                }
                self.stale_output = true;
                if self.status == BotStatus::Active {
                    self.transition(BotStatus::Unresponsive)?;
                }
                Ok(TurnOutcome::NoMove)
            }
            Err(e) => {
                if !matches!(e, ChannelError::Closed) {
                    warn!("bot output unreadable: {e}");
                }
                info!("bot disconnected");
                if let Some(logs) = self.logs.as_mut() {
                    logs.record_disconnect(turn);
                }
                self.shutdown();
                Ok(TurnOutcome::Disconnected)
            }
        }
    }

    /// Pause the bot. No-op when already suspended.
    #[instrument(skip(self), fields(bot = self.id()))]
    pub fn suspend(&mut self) -> Result<(), SupervisorError> {
        match self.status {
            BotStatus::Suspended => Ok(()),
            BotStatus::Active | BotStatus::Unresponsive => {
                self.send_signal(ControlSignal::Pause);
                self.resume_to = self.status;
                self.transition(BotStatus::Suspended)
            }
            status => Err(SupervisorError::not_allowed(status)),
        }
    }

    /// Continue a suspended bot, back to the status it had before. No-op when not suspended.
    #[instrument(skip(self), fields(bot = self.id()))]
    pub fn resume(&mut self) -> Result<(), SupervisorError> {
        match self.status {
            BotStatus::Active | BotStatus::Unresponsive => Ok(()),
            BotStatus::Suspended => {
                self.send_signal(ControlSignal::Continue);
                self.transition(self.resume_to)
            }
            status => Err(SupervisorError::not_allowed(status)),
        }
    }

    /// Exclude the bot from the game. The process is paused until shutdown.
    #[instrument(skip(self), fields(bot = self.id()))]
    pub fn disqualify(&mut self, reason: &str) -> Result<(), SupervisorError> {
        match self.status {
            BotStatus::Disqualified => Ok(()),
            BotStatus::Terminated => Err(SupervisorError::Terminated),
            _ => {
                warn!("bot disqualified: {reason}");
                self.send_signal(ControlSignal::Pause);
                if let Some(logs) = self.logs.as_mut() {
                    logs.record_disqualification(reason);
                }
                self.transition(BotStatus::Disqualified)
            }
        }
    }

    /// Stop the process, reap it, close the channel and the logs.
    ///
    /// Idempotent. Works from any status, including after a failed spawn.
    #[instrument(skip(self), fields(bot = self.id()))]
    pub fn shutdown(&mut self) {
        if self.status == BotStatus::Terminated {
            return;
        }
        self.channel.close_input();
        if let Some(mut process) = self.process.take() {
            match process.terminate(self.grace_period) {
                Ok(report) => {
                    debug!(?report, "bot process stopped");
                    self.exit_report = Some(report);
                }
                Err(e) => warn!("bot process not reaped: {e}"),
            }
        }
        self.channel.close_output();
        if let Some(logs) = self.logs.as_mut() {
            logs.close();
        }
        self.status = BotStatus::Terminated;
        info!("bot terminated");
    }

    fn send_signal(&mut self, kind: ControlSignal) {
        if let Some(process) = self.process.as_mut() {
            // failures are logged by the process handle
            process.signal(kind);
        }
    }

    fn transition(&mut self, to: BotStatus) -> Result<(), SupervisorError> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_become(to) {
            return Err(SupervisorError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        debug!(from = %self.status, %to, "status change");
        self.status = to;
        Ok(())
    }

    /// Bot id.
    pub fn id(&self) -> &str {
        self.launch.id()
    }

    /// How the bot was launched.
    pub fn launch(&self) -> &LaunchDescriptor {
        &self.launch
    }

    /// Sandbox policy the bot runs under.
    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Current status.
    pub fn status(&self) -> BotStatus {
        self.status
    }

    /// Every payload received so far, in turn order.
    pub fn moves(&self) -> &[Vec<u8>] {
        &self.moves
    }

    /// Number of turns attempted, forfeits included.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// True once the liveness marker was received.
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// Why the bot could not be started, if it could not.
    pub fn spawn_failure(&self) -> Option<&str> {
        self.spawn_failure.as_deref()
    }

    /// How the process ended, once shut down.
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit_report
    }

    /// OS process id. `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.process
            .as_ref()
            .filter(|p| p.exit_status().is_none())
            .map(BotProcess::id)
    }

    /// The transport to the bot.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Path of the move log, unless the log could not be created.
    pub fn moves_log_path(&self) -> Option<&Path> {
        self.logs.as_ref().map(BotLogs::moves_path)
    }

    /// Path of the diagnostic log, unless the log could not be created.
    pub fn stderr_log_path(&self) -> Option<&Path> {
        self.logs.as_ref().map(BotLogs::stderr_path)
    }
}

impl Drop for BotSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BotStatus::*;

    const ALL: [BotStatus; 5] = [Active, Suspended, Unresponsive, Disqualified, Terminated];

    #[test]
    fn terminated_is_absorbing() {
        for to in ALL {
            assert!(!Terminated.can_become(to), "terminated -> {to}");
        }
    }

    #[test]
    fn every_live_status_can_be_terminated() {
        for from in [Active, Suspended, Unresponsive, Disqualified] {
            assert!(from.can_become(Terminated), "{from} -> terminated");
        }
    }

    #[test]
    fn disqualified_only_leads_to_terminated() {
        for to in [Active, Suspended, Unresponsive] {
            assert!(!Disqualified.can_become(to));
        }
        for from in [Active, Suspended, Unresponsive] {
            assert!(from.can_become(Disqualified));
        }
    }

    #[test]
    fn suspension_and_recovery_edges() {
        assert!(Active.can_become(Suspended));
        assert!(Suspended.can_become(Active));
        assert!(Active.can_become(Unresponsive));
        assert!(Unresponsive.can_become(Active));
        assert!(Unresponsive.can_become(Suspended));
        assert!(Suspended.can_become(Unresponsive));
    }

    #[test]
    fn staying_put_is_not_a_transition() {
        for status in ALL {
            assert!(!status.can_become(status));
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(Disqualified.is_terminal());
        assert!(Terminated.is_terminal());
        assert!(!Active.is_terminal());
        assert!(!Suspended.is_terminal());
        assert!(!Unresponsive.is_terminal());
    }

    #[test]
    fn rejection_errors_name_the_status() {
        assert!(matches!(
            SupervisorError::not_allowed(Terminated),
            SupervisorError::Terminated
        ));
        assert!(matches!(
            SupervisorError::not_allowed(Disqualified),
            SupervisorError::Disqualified
        ));
        assert!(matches!(
            SupervisorError::not_allowed(Suspended),
            SupervisorError::NotActive(Suspended)
        ));
    }

    #[test]
    fn outcome_payload() {
        assert_eq!(TurnOutcome::Move(b"e4".to_vec()).payload(), Some(&b"e4"[..]));
        assert_eq!(TurnOutcome::NoMove.payload(), None);
        assert_eq!(TurnOutcome::Disconnected.payload(), None);
    }

    #[test]
    fn status_names() {
        assert_eq!(Unresponsive.to_string(), "unresponsive");
        assert_eq!(Terminated.to_string(), "terminated");
    }
}
