//! File logging for hosts embedding the ORM.
//!
//! # Responsibility
//! - Start rolling file logs once per process from a `LoggingConfig`.
//! - Keep statement text out of the logs unless explicitly requested; bound
//!   parameters are never logged.
//!
//! # Invariants
//! - Repeating init with an equal config is a no-op.
//! - Re-initialization with a different config is rejected.

use crate::error::{OrmError, OrmResult};
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const LOG_FILE_BASENAME: &str = "datamapper";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;

static LOGGING_STATE: OnceCell<LoggingState> = OnceCell::new();

/// Where and how verbosely the ORM writes its log files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// Absolute directory for the rolling files.
    pub dir: PathBuf,
    /// Log SQL statement text from the connection layer at debug level.
    pub log_statements: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level().to_string(),
            dir: PathBuf::new(),
            log_statements: false,
        }
    }
}

struct LoggingState {
    level: &'static str,
    dir: PathBuf,
    log_statements: bool,
    _logger: LoggerHandle,
}

impl LoggingState {
    fn ensure_matches(&self, level: &str, dir: &Path, log_statements: bool) -> OrmResult<()> {
        if self.dir.as_path() != dir
            || self.level != level
            || self.log_statements != log_statements
        {
            return Err(OrmError::Logging(format!(
                "logging already initialized with level `{}` at `{}`",
                self.level,
                self.dir.display()
            )));
        }
        Ok(())
    }
}

/// Starts ORM file logging.
///
/// # Errors
/// - `Logging` for an unknown level, a relative or empty directory, a
///   directory that cannot be created, a backend failure, or a conflicting
///   earlier init.
pub fn init_logging(config: &LoggingConfig) -> OrmResult<()> {
    let level = normalize_level(&config.level)?;
    let dir = normalize_log_dir(config)?;

    if let Some(state) = LOGGING_STATE.get() {
        return state.ensure_matches(level, &dir, config.log_statements);
    }

    let state = LOGGING_STATE.get_or_try_init(|| -> OrmResult<LoggingState> {
        std::fs::create_dir_all(&dir).map_err(|err| {
            OrmError::Logging(format!(
                "failed to create log directory `{}`: {err}",
                dir.display()
            ))
        })?;

        let logger = Logger::try_with_str(filter_spec(level, config.log_statements))
            .map_err(|err| OrmError::Logging(format!("invalid log level `{level}`: {err}")))?
            .log_to_file(
                FileSpec::default()
                    .directory(dir.as_path())
                    .basename(LOG_FILE_BASENAME),
            )
            .rotate(
                Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                Naming::Numbers,
                Cleanup::KeepLogFiles(MAX_LOG_FILES),
            )
            .write_mode(WriteMode::BufferAndFlush)
            .append()
            .format_for_files(flexi_logger::detailed_format)
            .start()
            .map_err(|err| OrmError::Logging(format!("failed to start logger: {err}")))?;

        info!(
            "event=logging_init module=logging status=ok level={} log_statements={} version={} log_dir={}",
            level,
            config.log_statements,
            env!("CARGO_PKG_VERSION"),
            dir.display()
        );

        Ok(LoggingState {
            level,
            dir: dir.clone(),
            log_statements: config.log_statements,
            _logger: logger,
        })
    })?;

    state.ensure_matches(level, &dir, config.log_statements)
}

/// Active `(level, log_dir)`, or `None` before init.
pub fn logging_status() -> Option<(&'static str, PathBuf)> {
    LOGGING_STATE
        .get()
        .map(|state| (state.level, state.dir.clone()))
}

pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn normalize_level(level: &str) -> OrmResult<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(OrmError::Logging(format!("unsupported log level `{other}`"))),
    }
}

fn normalize_log_dir(config: &LoggingConfig) -> OrmResult<PathBuf> {
    if config.dir.as_os_str().is_empty() || !config.dir.is_absolute() {
        return Err(OrmError::Logging(format!(
            "log dir must be an absolute path, got `{}`",
            config.dir.display()
        )));
    }
    Ok(config.dir.clone())
}

/// Scopes `level` to this crate. Statement text lives at debug in the
/// connection module, so it is capped at info unless requested.
fn filter_spec(level: &str, log_statements: bool) -> String {
    let crate_name = env!("CARGO_CRATE_NAME");
    let statements = match (log_statements, level) {
        (true, _) => "debug",
        (false, "trace" | "debug") => "info",
        (false, other) => other,
    };
    format!("warn, {crate_name}={level}, {crate_name}::connection={statements}")
}

#[cfg(test)]
mod tests {
    use super::{filter_spec, init_logging, logging_status, normalize_level, LoggingConfig};
    use crate::config::OrmConfig;
    use crate::error::OrmError;
    use std::path::PathBuf;

    #[test]
    fn statements_stay_out_of_debug_logs_unless_requested() {
        assert_eq!(
            filter_spec("debug", false),
            "warn, datamapper_core=debug, datamapper_core::connection=info"
        );
        assert_eq!(
            filter_spec("info", true),
            "warn, datamapper_core=info, datamapper_core::connection=debug"
        );
        assert_eq!(
            filter_spec("warn", false),
            "warn, datamapper_core=warn, datamapper_core::connection=warn"
        );
    }

    #[test]
    fn unknown_level_is_rejected() {
        assert_eq!(normalize_level(" Warning ").expect("known level"), "warn");
        assert!(matches!(normalize_level("loud"), Err(OrmError::Logging(_))));
    }

    #[test]
    fn relative_dir_is_rejected() {
        let config = LoggingConfig {
            dir: PathBuf::from("logs/dev"),
            ..LoggingConfig::default()
        };
        assert!(matches!(init_logging(&config), Err(OrmError::Logging(_))));
    }

    #[test]
    fn init_from_orm_config_is_idempotent_and_rejects_conflicts() {
        let dir = tempfile::tempdir().expect("temp dir");
        let json = format!(
            r#"{{"logging": {{"level": "info", "dir": {}}}}}"#,
            serde_json::to_string(dir.path()).expect("encode path")
        );
        let config = OrmConfig::from_json(&json).expect("parse config");
        let logging = config.logging.expect("logging section");

        init_logging(&logging).expect("first init");
        init_logging(&logging).expect("same config is a no-op");

        let louder = LoggingConfig {
            log_statements: true,
            ..logging.clone()
        };
        assert!(matches!(init_logging(&louder), Err(OrmError::Logging(_))));

        let (level, active_dir) = logging_status().expect("logging active");
        assert_eq!(level, "info");
        assert_eq!(active_dir, dir.path());
    }
}
