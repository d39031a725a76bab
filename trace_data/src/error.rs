use std::{fmt, io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("cannot find {path:?}")]
    NotFound { path: PathBuf },
    #[error("invalid data in {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("unsupported file version: {version} (supported: {min}..={max})")]
    Unsupported { version: u32, min: u32, max: u32 },
    #[error("inconsistent data in {path:?}: {reason}")]
    Inconsistent { path: PathBuf, reason: String },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("task log line is {len} bytes, limit is {max}")]
    LineTooLong { len: usize, max: usize },
    #[error("collaborator failed: {0}")]
    Collaborator(String),
}

pub type DataResult<T> = Result<T, DataError>;

impl DataError {
    /// Maps an open/read failure, keeping `NotFound` distinct so callers can
    /// try another source.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::Io { path, source }
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn inconsistent(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Inconsistent {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn collaborator(details: impl fmt::Display) -> Self {
        Self::Collaborator(details.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Errors after which a different source may still be tried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Io { .. })
    }
}
