use std::path::PathBuf;

use thiserror::Error;

/// Main error type for multiopt
#[derive(Error, Debug)]
pub enum MoError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Type cast failed for column {column}: {message}")]
    TypeCast { column: String, message: String },

    #[error("Objective function failed: {0}")]
    Objective(String),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised by shards, the master store and summaries
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Schema violation on column {column}: {message}")]
    SchemaViolation { column: String, message: String },

    #[error("Database error on {path}: {message}")]
    Database { path: PathBuf, message: String },

    #[error("Failed to merge shard {path}: {message}")]
    MergeIo { path: PathBuf, message: String },

    #[error("Failed to write summary {path}: {message}")]
    Summary { path: PathBuf, message: String },
}

impl StorageError {
    pub fn database(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Database {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn merge_io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::MergeIo {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for multiopt operations
pub type MoResult<T> = Result<T, MoError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::MoError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::MoError::Config(format!($($arg)*))
    };
}
