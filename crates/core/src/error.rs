//! Error types for snapkeeper
//!
//! Each variant maps to a unit of failure: configuration errors stop the
//! process at startup, everything else is contained to one cycle or sweep.

use thiserror::Error;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or conflicting settings, detected before scheduling starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// Snapshot create/delete failure
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Snapshot or data directory missing or not a directory
    #[error("Source validation failed: {0}")]
    SourceValidation(String),

    /// Copy failure reported by the transfer engine
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Bucket or object listing failure during a sweep
    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    /// Single object deletion failure
    #[error("Delete failed: {0}")]
    Deletion(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    General(String),
}

impl Error {
    /// Short, stable name of the failure class, used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Snapshot(_) => "snapshot",
            Error::SourceValidation(_) => "source_validation",
            Error::Transfer(_) => "transfer",
            Error::Enumeration(_) => "enumeration",
            Error::Deletion(_) => "deletion",
            Error::Network(_) => "network",
            Error::NotFound(_) => "not_found",
            Error::InvalidPath(_) => "invalid_path",
            Error::Cancelled(_) => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::Io(_) => "io",
            Error::General(_) => "general",
        }
    }

    /// Whether the error belongs to the startup class that stops the process
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Error::Config(_) | Error::InvalidPath(_))
    }
}
