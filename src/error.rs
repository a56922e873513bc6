use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling evidence containers.
///
/// Single-target operations (container creation) treat every variant as
/// fatal. Batch operations (list, mount, unmount, append-source iteration)
/// treat `Validation`, `Conflict`, and `Process` as per-target skips and
/// keep going.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Validation(String),

    #[error("`{command}` failed: {reason}")]
    Process { command: String, reason: String },

    #[error("{0}")]
    Conflict(String),

    #[error("cleanup failed: {0}")]
    Cleanup(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn process(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Process {
            command: command.into(),
            reason: reason.into(),
        }
    }
}
