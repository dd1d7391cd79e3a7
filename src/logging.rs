use crate::errors::LoggerError;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;

/// Builds the log subscriber without installing it
///
/// # Arguments
///
/// * 'log_path' - file to append log lines to, creating its folder when missing
/// * 'log_level' - one of off, error, warn, info, debug, trace
/// * 'log_to_stdout' - also log to stdout. Always on when no file is given.
pub fn build_subscriber(log_path: Option<&str>, log_level: &str, log_to_stdout: bool) -> Result<impl Subscriber + Send + Sync + 'static, LoggerError> {
    let level = LevelFilter::from_str(log_level).map_err(|_| LoggerError::Level(log_level.to_string()))?;

    let file_layer = match log_path {
        Some(path) => {
            let path = Path::new(path);
            if let Some(folder) = path.parent() {
                if !folder.as_os_str().is_empty() && !folder.exists() {
                    fs::create_dir_all(folder)?;
                }
            }
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(BoxMakeWriter::new(Mutex::new(file))))
        }
        None => None,
    };
    let stdout_layer = (log_to_stdout || log_path.is_none()).then(|| fmt::layer().with_writer(std::io::stdout));

    Ok(tracing_subscriber::registry().with(level).with(file_layer).with(stdout_layer))
}

/// Installs the global log subscriber
pub fn init_logging(log_path: Option<&str>, log_level: &str, log_to_stdout: bool) -> Result<(), LoggerError> {
    let subscriber = build_subscriber(log_path, log_level, log_to_stdout)?;
    tracing::subscriber::set_global_default(subscriber).map_err(|e| LoggerError::Subscriber(e.to_string()))
}
