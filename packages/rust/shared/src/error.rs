//! Error types for the importer.
//!
//! Library crates use [`ImportError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for all importer operations.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// Transport failure while fetching, downloading or saving.
    #[error("I/O error: {0}")]
    Io(String),

    /// An operation exceeded its allotted time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A downloaded payload could not be parsed.
    #[error("format error: {message}")]
    Format { message: String },

    /// The run's cancellation scope was triggered.
    #[error("operation cancelled")]
    Cancelled,

    /// A pool task panicked or was torn down unexpectedly.
    #[error("worker failed: {0}")]
    Worker(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    FsIo {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ImportError>;

/// Coarse classification of an [`ImportError`], used in logs and run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    Timeout,
    Format,
    Cancelled,
    Worker,
    Config,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::Timeout => "timeout",
            Self::Format => "format",
            Self::Cancelled => "cancelled",
            Self::Worker => "worker",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ImportError {
    /// Create an I/O error from any displayable message.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Create a format error from any displayable message.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format {
            message: msg.into(),
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FsIo {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::FsIo { .. } => ErrorKind::Io,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Format { .. } => ErrorKind::Format,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Worker(_) => ErrorKind::Worker,
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    /// Whether this error only signals that a cancellation scope fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
