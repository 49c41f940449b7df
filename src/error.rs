//! Failures surfaced to the game loop.
//!
//! Transport and process problems are handled inside the supervisor (state
//! transition + log entry). What reaches the caller is one of the variants
//! below, never an OS-level detail.

use std::io;

use thiserror::Error;

use crate::supervisor::BotStatus;

/// Failure of a single [`Channel`](crate::channel::Channel) operation.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No complete message arrived before the deadline.
    #[error("no complete message before the deadline")]
    Timeout,
    /// The peer closed its end (or the endpoint was already closed on our side).
    #[error("channel closed")]
    Closed,
    /// The bot did not drain its input before the deadline.
    #[error("pipe full: bot is not reading its input")]
    Full,
    /// The payload cannot be framed (it contains the frame delimiter).
    #[error("payload contains a newline and cannot be framed")]
    InvalidPayload,
    /// Any other I/O failure on the endpoint.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of a [`BotSupervisor`](crate::supervisor::BotSupervisor) operation.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The bot process could not be created. The bot is disqualified.
    #[error("spawn failure: {0}")]
    Spawn(String),
    /// The bot did not send the liveness marker in time.
    #[error("no handshake before the handshake timeout")]
    HandshakeTimeout,
    /// The bot answered the handshake with something other than the marker.
    #[error("handshake mismatch: got {0:?}")]
    HandshakeMismatch(String),
    /// The supervisor already reached its terminal state.
    #[error("bot is terminated")]
    Terminated,
    /// The engine disqualified this bot.
    #[error("bot is disqualified")]
    Disqualified,
    /// The operation requires another status.
    #[error("operation not allowed while bot is {0}")]
    NotActive(BotStatus),
    /// The requested transition is not in the transition table.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// current status
        from: BotStatus,
        /// refused target
        to: BotStatus,
    },
    /// Channel failure that is not a state change by itself.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
