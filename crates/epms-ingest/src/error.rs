//! Pipeline error taxonomy
//!
//! Every per-file failure is one of these variants. None of them are allowed to
//! escape the watcher loop; only startup code turns them into a process exit.

use std::path::PathBuf;
use thiserror::Error;

use crate::ingest::models::LogicalFileType;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// File name matches no registered type token
    #[error("Unrecognized file type: {0}")]
    UnknownFileType(String),

    /// File could not be read as delimited text
    #[error("Parse error in {file}: {message}")]
    Parse { file: PathBuf, message: String },

    /// Header lacks columns the mapping requires
    #[error("{file} is missing required {file_type} columns: {missing:?}")]
    MissingColumns {
        file: PathBuf,
        file_type: LogicalFileType,
        missing: Vec<String>,
    },

    /// Store rejected the batch; the transaction has been rolled back
    #[error("Persistence error on table {table}: {source}")]
    Persistence {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IngestError {
    pub fn parse(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        IngestError::Parse {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn persistence(table: &'static str, source: sqlx::Error) -> Self {
        IngestError::Persistence { table, source }
    }

    /// Whether a later sweep could succeed without anyone touching the file.
    ///
    /// Classification and parse failures need operator action; store and
    /// filesystem failures may be transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Persistence { .. } | IngestError::Io { .. } | IngestError::Task(_)
        )
    }
}
