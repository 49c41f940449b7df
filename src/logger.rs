use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::Context;
use time::{
    format_description::{self, parse},
    OffsetDateTime, UtcOffset,
};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

/// Install a global subscriber writing every event to a new file in `dir`.
///
/// Returns the path of the log file. Fails if another global subscriber is already set.
pub fn init_logger(dir: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("could not create log directory {}", dir.display()))?;
    let path = dir.join(get_log_file_name()?);
    let file = File::create(&path)
        .with_context(|| format!("could not create log file {}", path.display()))?;
    let writer = BoxMakeWriter::new(file);
    let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")?,
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::TRACE)
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber).context(
        "Could not set global default tracing subscriber. Consider disabling logs if you are already setting a subscriber.",
    )?;
    Ok(path)
}

fn get_log_file_name() -> anyhow::Result<String> {
    let format = parse("[year]-[month]-[day]_[hour]-[minute]-[second]_botctl.log")?;
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    Ok(now.format(&format)?)
}
