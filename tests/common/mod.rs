#![allow(dead_code)]

use std::{path::Path, time::Duration};

use botctl::prelude::*;
use tracing::{Level, Metadata};
use tracing_subscriber::{
    fmt,
    layer::{Context, Filter, SubscriberExt},
    Layer, Registry,
};

pub const MARKER: &str = "ready";

struct CustomLevelFilter;
impl<S> Filter<S> for CustomLevelFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        meta.level() <= &Level::DEBUG
    }
}

/// Debug output on the test harness' captured stdout.
pub fn init_test_logger() {
    let format = fmt::format()
        .without_time()
        .with_ansi(false)
        .with_level(true)
        .with_thread_names(true)
        .with_target(false);

    let reg = Registry::default().with(
        fmt::layer()
            .with_test_writer()
            .event_format(format)
            .with_filter(CustomLevelFilter),
    );

    let _ = tracing::subscriber::set_global_default(reg);
}

/// A bot written as a `/bin/sh` script.
pub fn sh(id: &str, script: &str) -> LaunchDescriptor {
    LaunchDescriptor::new(id, "/bin/sh")
        .with_args(["-c", script])
        .with_handshake_timeout(Duration::from_secs(2))
        .with_move_timeout(Duration::from_secs(2))
}

/// Prints the marker, then echoes every line back.
pub fn echo_bot(id: &str) -> LaunchDescriptor {
    sh(
        id,
        "echo ready; while IFS= read -r line; do printf '%s\\n' \"$line\"; done",
    )
}

pub fn config(log_dir: &Path) -> Configuration {
    Configuration::new()
        .with_log_dir(log_dir)
        .with_handshake_marker(MARKER)
}

pub fn engine(log_dir: &Path) -> Engine {
    init_test_logger();
    Engine::new(config(log_dir)).unwrap()
}
