//! Error kinds shared across the agent

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors loading or interpreting the configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("i/o error reading config: {0}")]
    Io(#[from] io::Error),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors from a source monitor or one of its OS seams.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor failed to start: {0}")]
    StartFailed(String),

    #[error("not supported on this host: {0}")]
    Unsupported(String),

    #[error("os error: {0}")]
    Os(#[from] io::Error),

    /// Recoverable condition; the caller retries on the next notification.
    #[error("transient: {0}")]
    Transient(String),
}

/// Result type for monitor operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

impl ConfigError {
    /// Maps a read failure to `NotFound` when the path does not resolve, and
    /// to `Io` otherwise.
    pub fn from_read(path: &std::path::Path, err: io::Error) -> ConfigError {
        if err.kind() == io::ErrorKind::NotFound {
            ConfigError::NotFound { path: path.to_path_buf() }
        } else {
            ConfigError::Io(err)
        }
    }
}
