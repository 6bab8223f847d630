//! Error types shared by every layer of the settings store.

use thiserror::Error;

/// Errors surfaced by the settings store.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage I/O or constraint failure.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// No storage connection could be obtained.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A batch ran too many operations without a declared yield point.
    #[error("too many operations between yield points (after {yield_points} yield points)")]
    Contention { yield_points: usize },

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A typed accessor was used against a value of another type.
    #[error("setting {key:?} holds a {actual} value, not {expected}")]
    State {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("unsupported resource: {0}")]
    InvalidResource(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The executing task was interrupted before it finished.
    #[error("task interrupted: {0}")]
    Interrupted(String),

    #[error("{0} has been shut down")]
    Shutdown(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Whether this error came from the storage layer.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Pool(_))
    }
}

/// Result type for settings store operations.
pub type Result<T> = std::result::Result<T, Error>;
