use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Canonical error type for all core operations.
///
/// Non-fatal conditions (a single unreadable file, a parser hiccup) are
/// recovered close to where they happen and surface as build warnings; this
/// enum carries only the failures callers must handle.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Empty selection, empty context, malformed path.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A selected path escapes the active project root.
    #[error("path escapes project root: {path}")]
    PathOutsideProject { path: String },

    /// Context id, symbol, or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The token budget cannot accommodate even a truncated first file.
    #[error("token limit exceeded: {actual} tokens against a cap of {limit}")]
    TokenLimitExceeded { actual: usize, limit: usize },

    /// Memory / size caps.
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// A language parser failed on one file. Downgraded to a warning during
    /// indexing; fatal only when a single-file operation was requested.
    #[error("parse error in {file_path}: {message}")]
    ParseError { file_path: String, message: String },

    /// Read/write failure with the operation and path that caused it.
    #[error("{op} failed for {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Cooperative cancellation (explicit cancel or deadline expiry).
    #[error("operation cancelled")]
    OperationCancelled,

    /// An operation was called before its prerequisites (e.g. no active
    /// project selected).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

impl CoreError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
