//! What the engine needs to know to start a bot.

use std::{path::PathBuf, time::Duration};

/// How to start one bot, and how long it may take to answer.
///
/// Parsing descriptors out of configuration files is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaunchDescriptor {
    id: String,
    program: PathBuf,
    args: Vec<String>,
    handshake_timeout: Duration,
    move_timeout: Duration,
}

impl LaunchDescriptor {
    /// Time a bot gets to print the handshake marker after launch.
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(200);
    /// Time a bot gets to answer a move request.
    pub const DEFAULT_MOVE_TIMEOUT: Duration = Duration::from_secs(1);

    /// Descriptor running `program` without arguments, with default timeouts.
    pub fn new(id: impl Into<String>, program: impl Into<PathBuf>) -> LaunchDescriptor {
        LaunchDescriptor {
            id: id.into(),
            program: program.into(),
            args: vec![],
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
            move_timeout: Self::DEFAULT_MOVE_TIMEOUT,
        }
    }

    /// Arguments given to the program.
    #[must_use]
    pub fn with_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(self, timeout: Duration) -> Self {
        Self {
            handshake_timeout: timeout,
            ..self
        }
    }

    /// Sets the per-move timeout.
    #[must_use]
    pub fn with_move_timeout(self, timeout: Duration) -> Self {
        Self {
            move_timeout: timeout,
            ..self
        }
    }

    /// Opaque bot identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Executable to run.
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Program arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Per-move timeout.
    pub fn move_timeout(&self) -> Duration {
        self.move_timeout
    }
}

/// `id` with every character outside `[A-Za-z0-9_-]` replaced by `_`.
pub(crate) fn file_safe(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "bot".to_owned()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_fields() {
        let launch = LaunchDescriptor::new("alpha", "/usr/bin/python3")
            .with_args(["bot.py", "--fast"])
            .with_handshake_timeout(Duration::from_millis(50))
            .with_move_timeout(Duration::from_millis(300));

        assert_eq!(launch.id(), "alpha");
        assert_eq!(launch.program(), std::path::Path::new("/usr/bin/python3"));
        assert_eq!(launch.args(), ["bot.py", "--fast"]);
        assert_eq!(launch.handshake_timeout(), Duration::from_millis(50));
        assert_eq!(launch.move_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn file_safe_strips_path_characters() {
        assert_eq!(file_safe("../etc/x y"), "___etc_x_y");
        assert_eq!(file_safe(""), "bot");
        assert_eq!(file_safe("team-7_b"), "team-7_b");
    }
}
