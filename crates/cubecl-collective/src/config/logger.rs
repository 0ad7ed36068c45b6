use super::collective::CollectiveLogLevel;
use alloc::vec::Vec;
use core::fmt::Display;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

/// Configuration for logging, parameterized by a log level type.
///
/// Note that you can use multiple loggers at the same time.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(bound = "")]
pub struct LoggerConfig<L: LogLevel> {
    /// Path to the log file, if file logging is enabled.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Whether to append to the log file (true) or overwrite it (false). Defaults to true.
    #[serde(default = "append_default")]
    pub append: bool,

    /// Whether to log to standard output.
    #[serde(default)]
    pub stdout: bool,

    /// Whether to log to standard error.
    #[serde(default)]
    pub stderr: bool,

    /// Optional crate-level logging configuration (e.g., info, debug, trace).
    #[serde(default)]
    pub log: Option<LogCrateLevel>,

    /// The log level for this logger, determining verbosity.
    #[serde(default)]
    pub level: L,
}

impl<L: LogLevel> Default for LoggerConfig<L> {
    fn default() -> Self {
        Self {
            file: None,
            append: true,
            stdout: false,
            stderr: false,
            log: None,
            level: L::default(),
        }
    }
}

/// Log levels using the `log` crate.
#[derive(
    Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize, Hash, PartialEq, Eq,
)]
pub enum LogCrateLevel {
    /// Logs informational messages.
    #[default]
    #[serde(rename = "info")]
    Info,

    /// Logs debugging messages.
    #[serde(rename = "debug")]
    Debug,

    /// Logs trace-level messages.
    #[serde(rename = "trace")]
    Trace,
}

fn append_default() -> bool {
    true
}

/// Trait for types that can be used as log levels in `LoggerConfig`.
pub trait LogLevel:
    serde::de::DeserializeOwned + serde::Serialize + Clone + Copy + core::fmt::Debug + Default
{
}

/// Fans process group messages out to every configured output.
#[derive(Debug)]
pub struct Logger {
    loggers: Vec<LoggerKind>,
    level: CollectiveLogLevel,
}

impl Logger {
    /// Creates a new `Logger` from the given configuration.
    ///
    /// A log file that can't be opened is skipped with a warning.
    pub fn new(config: &LoggerConfig<CollectiveLogLevel>) -> Self {
        let mut loggers = Vec::new();

        if config.level != CollectiveLogLevel::Disabled {
            if let Some(path) = &config.file {
                match FileLogger::new(path, config.append) {
                    Ok(logger) => loggers.push(LoggerKind::File(logger)),
                    Err(err) => log::warn!("Can't open log file {}: {err}", path.display()),
                }
            }
            if config.stdout {
                loggers.push(LoggerKind::Stdout);
            }
            if config.stderr {
                loggers.push(LoggerKind::Stderr);
            }
            if let Some(level) = config.log {
                loggers.push(LoggerKind::Log(level));
            }
        }

        Self {
            loggers,
            level: config.level,
        }
    }

    /// The configured log level.
    pub fn log_level(&self) -> CollectiveLogLevel {
        self.level
    }

    /// Whether messages of the given level are written.
    pub fn is_enabled(&self, level: CollectiveLogLevel) -> bool {
        level != CollectiveLogLevel::Disabled && level <= self.level && !self.loggers.is_empty()
    }

    /// Logs a message to every configured output.
    pub fn log_collective<S: Display>(&mut self, msg: &S) {
        for logger in self.loggers.iter_mut() {
            logger.log(msg);
        }
    }
}

/// Represents different types of loggers.
#[derive(Debug)]
enum LoggerKind {
    /// Logs to a file.
    File(FileLogger),

    /// Logs to standard output.
    Stdout,

    /// Logs to standard error.
    Stderr,

    /// Logs using the `log` crate with a specified level.
    Log(LogCrateLevel),
}

impl LoggerKind {
    fn log<S: Display>(&mut self, msg: &S) {
        match self {
            LoggerKind::File(file_logger) => file_logger.log(msg),
            LoggerKind::Stdout => println!("{msg}"),
            LoggerKind::Stderr => eprintln!("{msg}"),
            LoggerKind::Log(level) => match level {
                LogCrateLevel::Info => log::info!("{msg}"),
                LogCrateLevel::Debug => log::debug!("{msg}"),
                LogCrateLevel::Trace => log::trace!("{msg}"),
            },
        }
    }
}

/// Logger that writes messages to a file.
#[derive(Debug)]
struct FileLogger {
    writer: BufWriter<File>,
}

impl FileLogger {
    fn new(path: &PathBuf, append: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .append(append)
            .truncate(!append)
            .create(true)
            .open(path)?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    // Flushed on every message, a process may abort on the next library error.
    fn log<S: Display>(&mut self, msg: &S) {
        let result = writeln!(self.writer, "{msg}").and_then(|_| self.writer.flush());
        if let Err(err) = result {
            log::warn!("Failed to write to the log file: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn file_logger_writes_lines() {
        let path = std::env::temp_dir().join(format!(
            "cubecl-collective-logger-{}.log",
            std::process::id()
        ));
        let config = LoggerConfig {
            file: Some(path.clone()),
            append: false,
            level: CollectiveLogLevel::Basic,
            ..Default::default()
        };

        let mut logger = Logger::new(&config);
        logger.log_collective(&"first");
        logger.log_collective(&"second");

        assert!(logger.is_enabled(CollectiveLogLevel::Basic));
        assert!(!logger.is_enabled(CollectiveLogLevel::Full));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "first\nsecond\n"
        );
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn disabled_level_registers_nothing() {
        let config = LoggerConfig::<CollectiveLogLevel> {
            stdout: true,
            ..Default::default()
        };

        let logger = Logger::new(&config);

        assert!(!logger.is_enabled(CollectiveLogLevel::Basic));
        assert_eq!(logger.log_level(), CollectiveLogLevel::Disabled);
    }
}
