//! Per-bot move log and diagnostic log.
//!
//! Both files are named after the bot id plus a process-wide instance number, and created
//! with create-new semantics, so two supervisors never share a file even when they run the
//! same bot.

use std::{
    fs::{self, File},
    io::{self, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::Context;
use tracing::warn;

use crate::bot::file_safe;

static INSTANCE: AtomicUsize = AtomicUsize::new(1);

/// Attempts at finding a free instance number before giving up.
const MAX_NAME_ATTEMPTS: usize = 1000;

/// The log files of one supervisor.
#[derive(Debug)]
pub struct BotLogs {
    moves: Option<BufWriter<File>>,
    stderr: Option<File>,
    moves_path: PathBuf,
    stderr_path: PathBuf,
}

impl BotLogs {
    /// Create the two log files of `bot_id` in `dir` (created if missing).
    ///
    /// Also returns a handle on the diagnostic log, meant to become the bot's stderr.
    pub fn create(dir: &Path, bot_id: &str) -> anyhow::Result<(BotLogs, File)> {
        fs::create_dir_all(dir)
            .with_context(|| format!("could not create log directory {}", dir.display()))?;
        let stem = file_safe(bot_id);

        for _ in 0..MAX_NAME_ATTEMPTS {
            let n = INSTANCE.fetch_add(1, Ordering::Relaxed);
            let moves_path = dir.join(format!("{stem}-{n}.moves.log"));
            let stderr_path = dir.join(format!("{stem}-{n}.stderr.log"));

            let moves = match File::create_new(&moves_path) {
                Ok(file) => file,
                // left over by another run
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("could not create {}", moves_path.display()))
                }
            };
            let stderr = match File::create_new(&stderr_path) {
                Ok(file) => file,
                Err(e) => {
                    let _ = fs::remove_file(&moves_path);
                    if e.kind() == ErrorKind::AlreadyExists {
                        continue;
                    }
                    return Err(e)
                        .with_context(|| format!("could not create {}", stderr_path.display()));
                }
            };
            let child_stderr = stderr
                .try_clone()
                .context("could not duplicate the diagnostic log handle")?;

            let logs = BotLogs {
                moves: Some(BufWriter::new(moves)),
                stderr: Some(stderr),
                moves_path,
                stderr_path,
            };
            return Ok((logs, child_stderr));
        }
        anyhow::bail!(
            "no free log file name for '{bot_id}' in {} after {MAX_NAME_ATTEMPTS} attempts",
            dir.display()
        )
    }

    /// Path of the move log.
    pub fn moves_path(&self) -> &Path {
        &self.moves_path
    }

    /// Path of the diagnostic log.
    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    /// True once [`BotLogs::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.moves.is_none() && self.stderr.is_none()
    }

    /// A move received at `turn`. Non-printable bytes are escaped.
    pub fn record_move(&mut self, turn: u64, payload: &[u8]) {
        self.write_line(format_args!("{turn}\tmove\t{}", payload.escape_ascii()));
    }

    /// No move before the deadline at `turn`.
    pub fn record_forfeit(&mut self, turn: u64) {
        self.write_line(format_args!("{turn}\tforfeit"));
    }

    /// The bot closed its output at `turn`.
    pub fn record_disconnect(&mut self, turn: u64) {
        self.write_line(format_args!("{turn}\tdisconnected"));
    }

    /// The engine disqualified the bot.
    pub fn record_disqualification(&mut self, reason: &str) {
        self.write_line(format_args!("-\tdisqualified\t{}", reason.escape_debug()));
    }

    /// Flush and close both files. Later records are dropped.
    pub fn close(&mut self) {
        if let Some(mut moves) = self.moves.take() {
            if let Err(e) = moves.flush().and_then(|()| moves.get_ref().sync_all()) {
                warn!(path = %self.moves_path.display(), "move log not flushed: {e}");
            }
        }
        if let Some(stderr) = self.stderr.take() {
            if let Err(e) = stderr.sync_all() {
                warn!(path = %self.stderr_path.display(), "diagnostic log not synced: {e}");
            }
        }
    }

    fn write_line(&mut self, line: std::fmt::Arguments<'_>) {
        let Some(moves) = self.moves.as_mut() else {
            warn!("move log already closed, entry dropped: {line}");
            return;
        };
        let res: io::Result<()> = writeln!(moves, "{line}").and_then(|()| moves.flush());
        if let Err(e) = res {
            warn!(path = %self.moves_path.display(), "move log write failed: {e}");
        }
    }
}

impl Drop for BotLogs {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bot_gets_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = BotLogs::create(dir.path(), "alpha").unwrap();
        let (b, _) = BotLogs::create(dir.path(), "alpha").unwrap();

        assert_ne!(a.moves_path(), b.moves_path());
        assert_ne!(a.stderr_path(), b.stderr_path());
        let name = a.moves_path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("alpha-") && name.ends_with(".moves.log"));
    }

    #[test]
    fn hostile_id_stays_in_the_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (logs, _) = BotLogs::create(dir.path(), "../../escape").unwrap();
        assert_eq!(logs.moves_path().parent(), Some(dir.path()));
    }

    #[test]
    fn records_are_one_line_each() {
        let dir = tempfile::tempdir().unwrap();
        let (mut logs, _) = BotLogs::create(dir.path(), "b").unwrap();
        logs.record_move(1, b"e4");
        logs.record_forfeit(2);
        logs.record_move(3, b"a\tb\x01");
        logs.record_disconnect(4);
        logs.record_disqualification("too many\nforfeits");
        logs.close();
        assert!(logs.is_closed());

        let content = fs::read_to_string(logs.moves_path()).unwrap();
        assert_eq!(
            content,
            "1\tmove\te4\n2\tforfeit\n3\tmove\ta\\tb\\x01\n4\tdisconnected\n-\tdisqualified\ttoo many\\nforfeits\n"
        );
    }

    #[test]
    fn child_handle_writes_to_the_diagnostic_log() {
        let dir = tempfile::tempdir().unwrap();
        let (mut logs, mut child) = BotLogs::create(dir.path(), "b").unwrap();
        child.write_all(b"panic at turn 3\n").unwrap();
        drop(child);
        logs.close();
        assert_eq!(
            fs::read_to_string(logs.stderr_path()).unwrap(),
            "panic at turn 3\n"
        );
    }

    #[test]
    fn records_after_close_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut logs, _) = BotLogs::create(dir.path(), "b").unwrap();
        logs.close();
        logs.record_forfeit(1);
        logs.close();
        assert_eq!(fs::read_to_string(logs.moves_path()).unwrap(), "");
    }
}
