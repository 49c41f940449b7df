//! # botctl
//!
//! Supervision of untrusted bot programs playing a turn-based game against each other.
//!
//! Each bot runs as its own OS process, in its own process group, started under a
//! [`SandboxPolicy`](crate::sandbox::SandboxPolicy). The engine talks to it over its stdin and
//! stdout with newline-delimited messages, and every wait is bounded by a deadline: a bot that
//! stays silent forfeits its turn, it never stalls the engine or the other bots.
//!
//! It provides:
//! - [`BotSupervisor`](crate::supervisor::BotSupervisor): process, channel, logs and health
//!   state of one bot, with the turn protocol (`update_state`, `request_move`)
//! - [`Engine`](crate::engine::Engine): launches supervisors under a shared sandbox
//! - [`simultaneous_turn`](crate::turn::simultaneous_turn) for games where all bots move at once
//! - Resource limits through `setrlimit`, and optionally one cgroup v2 per bot
//!
//! Game rules, move legality and scheduling stay with the caller: the supervisor only reports
//! what the bot sent.
//!
//! # Documentation Overview
//!
//! - For the health state machine and the turn protocol, see the [`supervisor`] module.
//! - For engine behaviors (log directory, handshake marker, ...), see
//!   [`Configuration`](crate::configuration::Configuration).
//! - For resource restrictions and how they are enforced, see the [`sandbox`] module.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::time::{Duration, Instant};
//!
//! use botctl::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let policy = SandboxPolicyBuilder::new()
//!         .with_max_memory(512) // in MB
//!         .with_cpu_time(Duration::from_secs(10))
//!         .build()?;
//!     let engine = Engine::new(Configuration::from_env())?;
//!
//!     let mut bots = engine.launch_all(
//!         vec![
//!             LaunchDescriptor::new("white", "./bots/white"),
//!             LaunchDescriptor::new("black", "./bots/black").with_args(["--depth", "3"]),
//!         ],
//!         &policy,
//!     );
//!
//!     for turn in 1..=10 {
//!         let state = format!("turn:{turn}");
//!         let deadline = Instant::now() + Duration::from_millis(500);
//!         let results = simultaneous_turn(&mut bots, state.as_bytes(), deadline);
//!         for (bot, result) in bots.iter().zip(results) {
//!             println!("{}: {result:?}", bot.id());
//!         }
//!     }
//!
//!     for bot in &mut bots {
//!         bot.shutdown();
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Bot Requirements
//!
//! - Write the handshake marker (`I'm Poppy!` by default) on its own line right after start
//! - Read one state per line on stdin, answer with one move per line on stdout
//! - Diagnostics go to stderr, which is captured in a per-bot log file
#![warn(missing_docs)]

#[cfg(not(unix))]
compile_error!("botctl needs POSIX signals and pipes, only unix targets are supported");

pub use anyhow;

pub mod bot;
pub mod channel;
pub mod configuration;
pub mod engine;
pub mod error;
pub mod log_sink;
mod logger;
pub mod process;
pub mod sandbox;
pub mod supervisor;
pub mod turn;

/// Commonly used types for quick access.
///
/// ```rust
/// use botctl::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bot::LaunchDescriptor;
    pub use crate::configuration::Configuration;
    pub use crate::engine::Engine;
    pub use crate::error::{ChannelError, SupervisorError};
    pub use crate::sandbox::{SandboxPolicy, SandboxPolicyBuilder};
    pub use crate::supervisor::{BotStatus, BotSupervisor, TurnOutcome};
    pub use crate::turn::simultaneous_turn;
}
