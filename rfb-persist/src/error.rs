//! Error types for the persistent store and coordinator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index format error: {0}")]
    Format(String),

    #[error("entry not found")]
    NotFound,

    #[error("payload failed validation: {0}")]
    Corrupt(String),

    #[error("disk capacity exhausted")]
    DiskFull,

    #[error("coordinator error: {0}")]
    Coordinator(String),
}
