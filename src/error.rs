use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Error type shared by the updater and the mod registry.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("your operating system ({0}) is not supported")]
    UnsupportedPlatform(String),

    #[error("network failure for {url}: {message}")]
    NetworkFailure { url: String, message: String },

    #[error("failed to download {file} after {attempts} attempts: {reason}")]
    IntegrityMismatch {
        file: String,
        attempts: u32,
        reason: String,
    },

    #[error("failed to extract {path:?}: {message}")]
    ExtractionFailure { path: PathBuf, message: String },

    #[error("{path:?} is in use by another process")]
    PersistenceContention { path: PathBuf },

    #[error("{0:?} is not in the mod list")]
    NotFound(PathBuf),

    #[error("IO error at {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("invalid asset manifest: {0}")]
    InvalidManifest(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("mod registry is no longer running")]
    RegistryClosed,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        SyncError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn network(url: &str, message: impl ToString) -> Self {
        SyncError::NetworkFailure {
            url: url.to_owned(),
            message: message.to_string(),
        }
    }

    /// Wraps a write failure, classifying lock/sharing violations as contention.
    pub fn persist(path: impl AsRef<Path>, source: io::Error) -> Self {
        if is_contention(&source) {
            SyncError::PersistenceContention {
                path: path.as_ref().to_path_buf(),
            }
        } else {
            SyncError::io(path, source)
        }
    }
}

// Windows reports ERROR_SHARING_VIOLATION (32) and ERROR_LOCK_VIOLATION (33).
const SHARING_VIOLATION: i32 = 32;
const LOCK_VIOLATION: i32 = 33;

/// True when the file is transiently held open by another process.
#[must_use]
pub fn is_contention(err: &io::Error) -> bool {
    if cfg!(target_os = "windows")
        && matches!(
            err.raw_os_error(),
            Some(SHARING_VIOLATION | LOCK_VIOLATION)
        )
    {
        return true;
    }
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy | io::ErrorKind::WouldBlock
    )
}
