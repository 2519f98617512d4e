use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the document model.
///
/// Absence (no marker for an id, nothing to undo) is never an error; those
/// paths return `Option` or `bool`.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    #[error("invalid marker id: {0}")]
    InvalidMarkerId(String),

    #[error("invalid history state: {0}")]
    InvalidHistoryState(&'static str),

    #[error("transaction aborted")]
    TransactionAborted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid search pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("no free backup file name for {}", .0.display())]
    BackupExhausted(PathBuf),

    #[error("buffer has no file path")]
    NoFilePath,
}

pub type Result<T> = std::result::Result<T, BufferError>;
