use std::fmt;

use thiserror::Error;

use crate::codes::code_string;
use crate::resource::ResourceKind;

/// A native engine failure: the engine's status code, unchanged, plus a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// The (possibly extended) `SQLite` result code.
    pub code: i32,
    /// The engine-supplied message.
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", code_string(self.code), self.message)
    }
}

impl std::error::Error for ErrorRecord {}

impl From<rusqlite::Error> for ErrorRecord {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ffi_err, message) => ErrorRecord::new(
                ffi_err.extended_code,
                message.unwrap_or_else(|| ffi_err.to_string()),
            ),
            other => ErrorRecord::new(rusqlite::ffi::SQLITE_ERROR, other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// A failure reported by the native engine, surfaced verbatim.
    #[error(transparent)]
    Native(#[from] ErrorRecord),

    /// The connection's native handle has been closed.
    #[error("Database handle is closed")]
    HandleClosed,

    /// The resource already has an operation in flight; submissions are
    /// rejected, never queued.
    #[error("{0} is busy")]
    Busy(ResourceKind),

    /// The resource reached its terminal state and accepts no further
    /// operations.
    #[error("{0} is finalized")]
    Finalized(ResourceKind),

    #[error("configuration error: {0}")]
    Config(String),

    /// A dispatch channel was torn down before delivering a result.
    #[error("dispatch channel closed: {0}")]
    Disconnected(&'static str),
}

impl DispatchError {
    /// The `SQLite` status code this error maps to. Native errors keep
    /// the engine's code; misuse-class errors report `SQLITE_MISUSE`.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::Native(record) => record.code,
            DispatchError::HandleClosed | DispatchError::Finalized(_) => {
                rusqlite::ffi::SQLITE_MISUSE
            }
            DispatchError::Busy(_) => rusqlite::ffi::SQLITE_BUSY,
            DispatchError::Config(_) | DispatchError::Disconnected(_) => {
                rusqlite::ffi::SQLITE_ERROR
            }
        }
    }
}

impl From<rusqlite::Error> for DispatchError {
    fn from(err: rusqlite::Error) -> Self {
        DispatchError::Native(ErrorRecord::from(err))
    }
}
