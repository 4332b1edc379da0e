//! Typed failures at the boundaries where callers need to branch.
//!
//! Everything else propagates as [`anyhow::Error`]. These enums exist where
//! the import pipeline must tell a per-file skip apart from an abort, and
//! where the embedding engine records why it is not ready.

use std::path::PathBuf;

/// Why a single file could not be indexed. The import continues.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("unreadable: {0}")]
    Unreadable(String),

    #[error("no extractable text")]
    NoText,

    #[error("store write failed: {0}")]
    StoreWrite(String),
}

impl FileError {
    /// Short tag used in logs and skip reports.
    pub fn kind(&self) -> &'static str {
        match self {
            FileError::UnsupportedFormat(_) => "unsupported_format",
            FileError::Unreadable(_) => "unreadable",
            FileError::NoText => "no_text",
            FileError::StoreWrite(_) => "store_write",
        }
    }
}

/// Text extraction failure for one file.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExtractError> for FileError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Unsupported(ext) => FileError::UnsupportedFormat(ext),
            other => FileError::Unreadable(other.to_string()),
        }
    }
}

/// Index store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("vector dimension mismatch: index holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("passage and vector counts differ: {passages} passages, {vectors} vectors")]
    VectorCount { passages: usize, vectors: usize },

    /// The store itself is unusable (closed pool, I/O failure, corruption).
    #[error("index store unavailable: {0}")]
    Fatal(sqlx::Error),

    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if is_fatal(&e) {
            StoreError::Fatal(e)
        } else {
            StoreError::Sqlx(e)
        }
    }
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Fatal(_))
    }
}

/// SQLite primary codes meaning the database file itself is unusable.
const FATAL_SQLITE_CODES: &[&str] = &["11", "13", "14", "26"];

fn is_fatal(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| {
                // Extended codes carry the primary code in the low byte.
                let primary = code
                    .parse::<i32>()
                    .map(|c| (c & 0xff).to_string())
                    .unwrap_or_else(|_| code.to_string());
                FATAL_SQLITE_CODES.contains(&primary.as_str())
            })
            .unwrap_or(false),
        _ => false,
    }
}

/// Why the embedding model could not be loaded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelLoadError {
    /// A required asset is absent. The engine becomes `Unavailable`.
    #[error("model asset missing: {}", .0.display())]
    Missing(PathBuf),

    /// Assets exist but the runtime rejected them. The engine becomes `Failed`.
    #[error("{0}")]
    Failed(String),
}
