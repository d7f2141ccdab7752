use std::{
    fs::{File, OpenOptions},
    io,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::Utc;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Accepts the configuration spellings `error`, `warning`, `info` and `debug`.
    /// Anything else falls back to `Warn`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "error" => Self::Error,
            "warning" | "warn" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => Self::Warn,
        }
    }

    pub fn as_tracing(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

struct Logger {
    writer: Option<Mutex<File>>,
    min_level: Level,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

const DEFAULT_MIN_LEVEL: Level = Level::Warn;

/// Install the process-wide logger. With a `log_dir`, records are appended to
/// `<log_dir>/gateway.log` (falling back to `./logs`); without one, only the
/// `tracing` mirror is used. Returns the directory actually written to.
pub fn init(log_dir: Option<PathBuf>, min_level: Level) -> anyhow::Result<Option<PathBuf>> {
    let Some(log_dir) = log_dir else {
        if LOGGER
            .set(Logger {
                writer: None,
                min_level,
            })
            .is_err()
        {
            anyhow::bail!("gateway logger already initialized");
        }
        return Ok(None);
    };

    let fallback = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("logs");

    let mut candidates = vec![log_dir.clone()];
    if fallback != log_dir {
        candidates.push(fallback.clone());
    }

    let mut last_error: Option<(PathBuf, io::Error)> = None;
    for candidate in candidates {
        match try_open_gateway_log(&candidate) {
            Ok(file) => {
                let logger = Logger {
                    writer: Some(Mutex::new(file)),
                    min_level,
                };
                if LOGGER.set(logger).is_err() {
                    anyhow::bail!("gateway logger already initialized");
                }
                if candidate != log_dir {
                    eprintln!(
                        "unable to write gateway.log at {}; falling back to {}",
                        log_dir.display(),
                        candidate.display()
                    );
                }
                return Ok(Some(candidate));
            }
            Err(err) => {
                last_error = Some((candidate, err));
            }
        }
    }

    if let Some((path, err)) = last_error {
        Err(anyhow::anyhow!(
            "unable to open gateway log at {}: {}",
            path.display(),
            err
        ))
    } else {
        anyhow::bail!("unable to initialize gateway log")
    }
}

fn try_open_gateway_log(log_dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join("gateway.log");
    OpenOptions::new().create(true).append(true).open(&path)
}

pub fn log(level: Level, target: &str, message: String) {
    let logger = LOGGER.get();
    let min_level = logger
        .map(|logger| logger.min_level)
        .unwrap_or(DEFAULT_MIN_LEVEL);
    if level < min_level {
        return;
    }
    match level {
        Level::Trace => tracing::trace!(target_module = target, "{message}"),
        Level::Debug => tracing::debug!(target_module = target, "{message}"),
        Level::Info => tracing::info!(target_module = target, "{message}"),
        Level::Warn => tracing::warn!(target_module = target, "{message}"),
        Level::Error => tracing::error!(target_module = target, "{message}"),
    }
    let Some(writer) = logger.and_then(|logger| logger.writer.as_ref()) else {
        return;
    };
    let mut writer = match writer.lock() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let timestamp = Utc::now().to_rfc3339();
    if writeln!(
        *writer,
        "{timestamp} [{level:?}] {target} - {message}",
        level = level,
        target = target,
        message = message
    )
    .is_err()
    {
        let _ = writer.flush();
    }
}

pub fn trace(target: &str, message: impl AsRef<str>) {
    log(Level::Trace, target, message.as_ref().to_string());
}

pub fn debug(target: &str, message: impl AsRef<str>) {
    log(Level::Debug, target, message.as_ref().to_string());
}

pub fn info(target: &str, message: impl AsRef<str>) {
    log(Level::Info, target, message.as_ref().to_string());
}

pub fn warn(target: &str, message: impl AsRef<str>) {
    log(Level::Warn, target, message.as_ref().to_string());
}

pub fn error(target: &str, message: impl AsRef<str>) {
    log(Level::Error, target, message.as_ref().to_string());
}
