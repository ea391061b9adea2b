//! Error types for Sluice.

use thiserror::Error;

/// Result type alias using Sluice's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Buffer allocation failed.
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// Operation not permitted in the object's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pad link failed.
    #[error("link failed: {0}")]
    Link(#[from] crate::pad::PadLinkError),

    /// A streaming task could not be started or joined.
    #[error("task error: {0}")]
    Task(String),

    /// Timed out waiting for an operation to complete.
    #[error("timed out: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
