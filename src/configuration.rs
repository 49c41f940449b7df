//! Config for the engine behaviors
//!
//! This module provides configuration options shared by every bot an [`Engine`](crate::engine::Engine)
//! launches.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional. Set a flag to `"true"` (case-insensitive) to enable it.
//!
//! - `BOTCTL_LOG` — Install the engine tracing subscriber, writing to `log_dir` (default: `false`)
//! - `BOTCTL_LOG_DIR` — Directory for per-bot move/stderr logs and the engine log (default: `<tmp>/botctl`)
//! - `BOTCTL_ALLOW_UNCONTAINED` — Run bots even if part of their sandbox policy cannot be enforced (default: `false`)
//! - `BOTCTL_CGROUPS` — Also enforce policies with a cgroup v2 per bot (default: `false`)
//! - `BOTCTL_HANDSHAKE_MARKER` — Liveness message expected from a freshly started bot (default: `I'm Poppy!`)
//! - `BOTCTL_GRACE_PERIOD_MS` — Time a bot gets to exit after SIGTERM before SIGKILL (default: `100`)
//! - `BOTCTL_MAX_FRAME_LEN` — Longest accepted message from a bot, in bytes (default: `1048576`)

use std::{path::PathBuf, time::Duration};

/// Configuration for engine behaviors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) log: bool,
    pub(crate) log_dir: PathBuf,
    pub(crate) allow_uncontained: bool,
    pub(crate) use_cgroups: bool,
    pub(crate) handshake_marker: String,
    pub(crate) grace_period: Duration,
    pub(crate) max_frame_len: usize,
}

impl Configuration {
    /// Marker a bot must print right after launch. Kept for compatibility with existing bots.
    pub const DEFAULT_HANDSHAKE_MARKER: &'static str = "I'm Poppy!";
    /// Default time between SIGTERM and SIGKILL.
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(100);
    /// Default frame size limit (1 MiB).
    pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 20;

    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - No tracing subscriber is installed.
    /// - Bot logs go to `botctl/` under the system temporary directory.
    /// - Bots whose sandbox policy cannot be fully enforced are refused.
    /// - Only the rlimit backend enforces policies (no cgroups).
    /// - Bots must greet with `I'm Poppy!`.
    pub fn new() -> Self {
        Self {
            log: false,
            log_dir: std::env::temp_dir().join("botctl"),
            allow_uncontained: false,
            use_cgroups: false,
            handshake_marker: Self::DEFAULT_HANDSHAKE_MARKER.to_owned(),
            grace_period: Self::DEFAULT_GRACE_PERIOD,
            max_frame_len: Self::DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the [module documentation](self) for recognized variables. Unset or unparsable
    /// values fall back to the defaults of [`Configuration::new()`].
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |var: &str, default: bool| match lookup(var) {
            Some(val) => val.eq_ignore_ascii_case("true"),
            None => default,
        };
        let defaults = Self::new();

        Self {
            log: flag("BOTCTL_LOG", defaults.log),
            log_dir: lookup("BOTCTL_LOG_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            allow_uncontained: flag("BOTCTL_ALLOW_UNCONTAINED", defaults.allow_uncontained),
            use_cgroups: flag("BOTCTL_CGROUPS", defaults.use_cgroups),
            handshake_marker: lookup("BOTCTL_HANDSHAKE_MARKER")
                .filter(|marker| !marker.is_empty() && !marker.contains('\n'))
                .unwrap_or(defaults.handshake_marker),
            grace_period: lookup("BOTCTL_GRACE_PERIOD_MS")
                .and_then(|ms| ms.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.grace_period),
            max_frame_len: lookup("BOTCTL_MAX_FRAME_LEN")
                .and_then(|len| len.parse().ok())
                .filter(|len| *len > 0)
                .unwrap_or(defaults.max_frame_len),
        }
    }

    /// Enable or disable the engine log file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Directory where per-bot logs (and the engine log) are created.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Enable or disable unsafe fallbacks.
    ///
    /// When enabled, a bot is started even if some capability its policy requests has no
    /// enforcing backend. A warning is logged instead.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable the cgroup v2 backend (Linux only).
    pub fn with_cgroups(mut self, value: bool) -> Self {
        self.use_cgroups = value;
        self
    }

    /// Liveness message a bot must print first. Must not contain a newline.
    pub fn with_handshake_marker(mut self, marker: impl Into<String>) -> Self {
        self.handshake_marker = marker.into();
        self
    }

    /// Time a bot gets to exit after SIGTERM before it is killed.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Longest message accepted from a bot. Longer output is cut into several messages.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len.max(1);
        self
    }

    /// Directory of the bot logs.
    pub fn log_dir(&self) -> &std::path::Path {
        &self.log_dir
    }

    /// Expected handshake marker.
    pub fn handshake_marker(&self) -> &str {
        &self.handshake_marker
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
