//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `ZEUS_LOG` environment variable (e.g. "info", "debug")
//! 3. default to `info`
//!
//! The level sits behind a reload layer so shutdown can quiet everything
//! below `error` while subsystems wind down.

use anyhow::Result;
use clap::ValueEnum;
use nu_ansi_term::Color;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, Registry};

/// Environment variable consulted when no `--log-level` is given
pub const LOG_ENV: &str = "ZEUS_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Handle on the installed subscriber's level
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<LevelFilter, Registry>,
}

impl LogControl {
    /// Drop everything below `error`
    pub fn suppress(&self) {
        let _ = self.handle.modify(|filter| *filter = LevelFilter::ERROR);
    }
}

/// Initialise the global logging subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(cli_level: Option<LogLevel>, color: bool) -> Result<LogControl> {
    let level = resolve_level(cli_level, std::env::var(LOG_ENV).ok().as_deref());

    let (filter, handle) = reload::Layer::new(level);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(color)
                .with_target(true)
                .with_thread_names(false),
        )
        .try_init()?;

    Ok(LogControl { handle })
}

/// The line printed when the master starts
pub fn starting_banner(color: bool) -> String {
    if !color {
        return "Starting Zeus server".to_string();
    }
    format!(
        "{}{}{}{}{}{}",
        Color::Green.paint("Starting "),
        Color::Yellow.paint("Z"),
        Color::Red.paint("e"),
        Color::Blue.paint("u"),
        Color::Magenta.paint("s"),
        Color::Green.paint(" server"),
    )
}

fn resolve_level(cli_level: Option<LogLevel>, env_value: Option<&str>) -> LevelFilter {
    match cli_level {
        Some(lvl) => level_from_log_level(lvl),
        None => env_value
            .and_then(parse_level_str)
            .unwrap_or(LevelFilter::INFO),
    }
}

fn level_from_log_level(lvl: LogLevel) -> LevelFilter {
    match lvl {
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<LevelFilter> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(LevelFilter::ERROR),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        "trace" => Some(LevelFilter::TRACE),
        "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}
