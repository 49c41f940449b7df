//! Byte transport between the engine and one bot process.
//!
//! A channel owns the engine side of two one-way pipes: `input` (engine → bot, bound to the
//! bot's stdin) and `output` (bot → engine, bound to its stdout). Messages are newline
//! delimited. Every wait is bounded by a deadline: reads race readiness polling against the
//! deadline and are abandoned (never killed) when it expires. Bytes already received stay
//! buffered for the next attempt.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::time::Instant;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{trace, warn};

use crate::error::ChannelError;

const DELIMITER: u8 = b'\n';
const READ_CHUNK: usize = 4096;
/// Upper bound on reads done by a single [`Channel::discard_pending`].
const MAX_DISCARD_READS: usize = 64;

/// Engine side of the two pipes connected to a bot.
#[derive(Debug)]
pub struct Channel {
    input: Option<File>,
    output: Option<File>,
    buffer: Vec<u8>,
    max_frame_len: usize,
    output_eof: bool,
}

impl Channel {
    /// Wrap the engine ends of the bot's stdin (`input`) and stdout (`output`).
    ///
    /// The input end is switched to non-blocking mode, so that a bot that stops reading can
    /// never block the engine past a deadline.
    pub fn new(
        input: impl Into<OwnedFd>,
        output: impl Into<OwnedFd>,
        max_frame_len: usize,
    ) -> io::Result<Channel> {
        let input = File::from(input.into());
        set_nonblocking(&input)?;
        Ok(Channel {
            input: Some(input),
            output: Some(File::from(output.into())),
            buffer: vec![],
            max_frame_len: max_frame_len.max(1),
            output_eof: false,
        })
    }

    /// A channel whose both directions are already closed.
    pub fn closed(max_frame_len: usize) -> Channel {
        Channel {
            input: None,
            output: None,
            buffer: vec![],
            max_frame_len: max_frame_len.max(1),
            output_eof: true,
        }
    }

    /// Write `payload` as one message.
    ///
    /// Waits for room in the pipe until `deadline`, then fails with [`ChannelError::Full`].
    /// If the message was only partly written, the input direction is closed since the bot
    /// can no longer find message boundaries in it.
    pub fn send(&mut self, payload: &[u8], deadline: Instant) -> Result<(), ChannelError> {
        if payload.contains(&DELIMITER) {
            return Err(ChannelError::InvalidPayload);
        }
        let Some(input) = self.input.as_mut() else {
            return Err(ChannelError::Closed);
        };

        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.extend_from_slice(payload);
        frame.push(DELIMITER);

        let mut written = 0;
        let result = loop {
            if written == frame.len() {
                break Ok(());
            }
            match input.write(&frame[written..]) {
                Ok(0) => break Err(ChannelError::Closed),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        break Err(ChannelError::Full);
                    }
                    if let Err(e) = wait_ready(input.as_fd(), PollFlags::POLLOUT, deadline) {
                        break Err(e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::BrokenPipe => break Err(ChannelError::Closed),
                Err(e) => break Err(ChannelError::Io(e)),
            }
        };

        match &result {
            Err(ChannelError::Closed) => {
                self.close_input();
            }
            Err(ChannelError::Full) if written > 0 => {
                warn!(written, total = frame.len(), "message cut by a full pipe");
                self.close_input();
            }
            _ => trace!(len = payload.len(), "message sent"),
        }
        result
    }

    /// Read the next message, waiting until `deadline` at most.
    ///
    /// A message is only accepted while `now < deadline`: once the deadline is reached this
    /// returns [`ChannelError::Timeout`], even if a complete message is already buffered.
    ///
    /// Trailing bytes written before the bot closed its output are returned as a last
    /// message; the next call then reports [`ChannelError::Closed`].
    pub fn receive(&mut self, deadline: Instant) -> Result<Vec<u8>, ChannelError> {
        loop {
            if Instant::now() >= deadline {
                return Err(ChannelError::Timeout);
            }
            if let Some(frame) = self.take_frame() {
                return Ok(frame);
            }
            if self.output_eof {
                if self.buffer.is_empty() {
                    return Err(ChannelError::Closed);
                }
                return Ok(mem::take(&mut self.buffer));
            }
            let Some(output) = self.output.as_mut() else {
                return Err(ChannelError::Closed);
            };

            if !wait_ready(output.as_fd(), PollFlags::POLLIN, deadline)? {
                continue;
            }
            let mut chunk = [0; READ_CHUNK];
            match output.read(&mut chunk) {
                Ok(0) => self.output_eof = true,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }

    /// Drop everything buffered or immediately readable. Returns the number of bytes dropped.
    ///
    /// Never waits: only output the bot already produced is discarded.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = mem::take(&mut self.buffer).len();
        if self.output_eof {
            return dropped;
        }
        let Some(output) = self.output.as_mut() else {
            return dropped;
        };

        let mut chunk = [0; READ_CHUNK];
        for _ in 0..MAX_DISCARD_READS {
            match wait_ready(output.as_fd(), PollFlags::POLLIN, Instant::now()) {
                Ok(true) => {}
                _ => break,
            }
            match output.read(&mut chunk) {
                Ok(0) => {
                    self.output_eof = true;
                    break;
                }
                Ok(n) => dropped += n,
                Err(_) => break,
            }
        }
        dropped
    }

    /// Close the engine → bot direction. Returns `false` if it was already closed.
    pub fn close_input(&mut self) -> bool {
        self.input.take().is_some()
    }

    /// Close the bot → engine direction. Returns `false` if it was already closed.
    pub fn close_output(&mut self) -> bool {
        self.output_eof = true;
        self.buffer.clear();
        self.output.take().is_some()
    }

    /// Close both directions.
    pub fn close(&mut self) {
        self.close_input();
        self.close_output();
    }

    /// True once the engine → bot direction is closed.
    pub fn is_input_closed(&self) -> bool {
        self.input.is_none()
    }

    /// True once the bot → engine direction is closed.
    pub fn is_output_closed(&self) -> bool {
        self.output.is_none()
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let limit = self.max_frame_len;
        match self.buffer.iter().position(|&b| b == DELIMITER) {
            Some(pos) if pos <= limit => {
                let mut frame: Vec<u8> = self.buffer.drain(..=pos).collect();
                frame.pop();
                Some(frame)
            }
            _ if self.buffer.len() >= limit => {
                warn!(limit, "bot output exceeds the frame limit, cutting it");
                Some(self.buffer.drain(..limit).collect())
            }
            _ => None,
        }
    }
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Wait until `fd` is ready for `events` or `deadline` passes. `Ok(false)` means not ready.
fn wait_ready(fd: BorrowedFd<'_>, events: PollFlags, deadline: Instant) -> Result<bool, ChannelError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    // round up so that a wake-up never happens before the deadline
    let millis = remaining.as_micros().div_ceil(1000).min(u128::from(u16::MAX)) as u16;
    let mut fds = [PollFd::new(fd, events)];
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(ChannelError::Io(errno.into())),
    }
}
