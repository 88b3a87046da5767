//! Logging.
//!
//! The runtime logs under a fixed set of targets (`plant`,
//! `scheduler`, `bus`, `net`, `io`, `timer`), and the interesting
//! traffic is rarely uniform: debugging a stalled group wants
//! `scheduler` at trace while the transport stays quiet. The logger
//! here filters per target, configured programmatically or through
//! `RUST_LOG=level,target=level,..`.

use std::io;
use std::io::Write;

use chrono::Local;
use colored::Colorize;
use log::{Level, Log, Metadata, Record};

/// Width of the target column: sized for `scheduler`, the longest
/// target the runtime logs under.
const TARGET_WIDTH: usize = "scheduler".len();

/// A stdout logger with per-target levels.
pub struct Logger {
    /// Level for targets without an override.
    level: Level,
    /// Per-target overrides, matched by prefix.
    overrides: Vec<(String, Level)>,
}

impl Logger {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            overrides: Vec::new(),
        }
    }

    /// Raise or lower the level of one target.
    pub fn target(mut self, target: impl Into<String>, level: Level) -> Self {
        self.overrides.push((target.into(), level));
        self
    }

    /// Build a logger from the `RUST_LOG` environment variable.
    /// `RUST_LOG=info,net=trace` traces the transport while the rest of
    /// the runtime logs at info.
    pub fn from_env() -> Self {
        match std::env::var("RUST_LOG") {
            Ok(spec) => Self::parse(&spec),
            Err(_) => Self::new(Level::Info),
        }
    }

    fn parse(spec: &str) -> Self {
        let mut logger = Self::new(Level::Info);
        for part in spec.split(',') {
            match part.split_once('=') {
                Some((target, level)) => {
                    if let Ok(level) = level.trim().parse() {
                        logger = logger.target(target.trim(), level);
                    }
                }
                None => {
                    if let Ok(level) = part.trim().parse() {
                        logger.level = level;
                    }
                }
            }
        }
        logger
    }

    fn level_for(&self, target: &str) -> Level {
        self.overrides
            .iter()
            .find(|(prefix, _)| target.starts_with(prefix.as_str()))
            .map(|(_, level)| *level)
            .unwrap_or(self.level)
    }

    /// The most verbose level any target may log at.
    fn max_level(&self) -> Level {
        self.overrides
            .iter()
            .map(|(_, level)| *level)
            .chain([self.level])
            .max()
            .expect("the default level is always present")
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Pad before coloring: escape codes would count into the width.
        let level = match record.level() {
            Level::Error => "error".red().bold(),
            Level::Warn => " warn".yellow(),
            Level::Info => " info".normal(),
            Level::Debug => "debug".dimmed(),
            Level::Trace => "trace".dimmed(),
        };
        let target = format!("{:>width$}", record.target(), width = TARGET_WIDTH);

        writeln!(
            io::stdout(),
            "{} {level} {} {}",
            Local::now().format("%H:%M:%S%.3f"),
            target.cyan(),
            record.args()
        )
        .ok();
    }

    fn flush(&self) {
        io::stdout().flush().ok();
    }
}

/// Install the logger as the global log sink.
pub fn init(logger: Logger) -> Result<(), log::SetLoggerError> {
    log::set_max_level(logger.max_level().to_level_filter());
    log::set_boxed_logger(Box::new(logger))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_overrides() {
        let logger = Logger::new(Level::Info).target("net", Level::Trace);

        assert_eq!(logger.level_for("net"), Level::Trace);
        assert_eq!(logger.level_for("scheduler"), Level::Info);
        assert_eq!(logger.max_level(), Level::Trace);

        assert!(logger.enabled(&Metadata::builder().level(Level::Trace).target("net").build()));
        assert!(!logger.enabled(
            &Metadata::builder()
                .level(Level::Trace)
                .target("scheduler")
                .build()
        ));
    }

    #[test]
    fn test_parse_spec() {
        let logger = Logger::parse("debug, net=trace, scheduler=warn");

        assert_eq!(logger.level, Level::Debug);
        assert_eq!(logger.level_for("net"), Level::Trace);
        assert_eq!(logger.level_for("scheduler"), Level::Warn);
        assert_eq!(logger.level_for("bus"), Level::Debug);

        let logger = Logger::parse("nonsense");
        assert_eq!(logger.level, Level::Info);
    }
}
