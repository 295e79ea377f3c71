//! Terminal logging through simplelog.

use log::{LevelFilter, SetLoggerError};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

use crate::config::Config;

/// HTTP stack crates that log every connection. Matching is by prefix, so `tower`
/// also covers `tower_sessions`.
const NOISY_DEPENDENCIES: &[&str] = &["reqwest", "hyper", "h2", "tower", "axum"];

pub struct Logger {}

impl Logger {
    /// Install the global terminal logger at the configured level.
    ///
    /// Dependency output is only shown at TRACE.
    pub fn init_logger(config: &Config) -> Result<(), SetLoggerError> {
        let level = config.log_level_filter;
        TermLogger::init(
            level,
            log_config(level),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )
    }
}

fn ignored_modules(level: LevelFilter) -> &'static [&'static str] {
    if level == LevelFilter::Trace {
        &[]
    } else {
        NOISY_DEPENDENCIES
    }
}

fn log_config(level: LevelFilter) -> simplelog::Config {
    let mut builder = ConfigBuilder::new();
    builder.set_time_format_rfc3339();
    for module in ignored_modules(level) {
        builder.add_filter_ignore_str(module);
    }
    builder.build()
}
