use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("access to path outside of sandbox root is not allowed: {path}")]
    OutsideRoot { path: String },
    #[error("file or directory not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("content verification failed for {}: {detail}", path.display())]
    Verification { path: PathBuf, detail: String },
    #[error("failed to create folder: {}", path.display())]
    CreateFailed { path: PathBuf },
    #[error("file too large: {} is {size} bytes which exceeds the limit", path.display())]
    FileTooLarge { path: PathBuf, size: u64 },
    #[error("process execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("snapshot error: {0}")]
    Snapshot(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl SandboxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SandboxError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the retry loop should attempt the operation again.
    ///
    /// Sandbox violations, missing targets and caller mistakes fail fast.
    /// Verification, creation and generic I/O faults are all treated as
    /// transient, permission errors included.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::Verification { .. }
                | SandboxError::CreateFailed { .. }
                | SandboxError::Io { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
