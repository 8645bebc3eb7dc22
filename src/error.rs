use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::path::HistoryPath;

/// Errors raised by the history store and its storage layers.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to {op} '{}': {source}", .path.display())]
    Storage {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Bucket database error at '{context}': {source}")]
    Database {
        context: String,
        source: sled::Error,
    },

    #[error("Corrupt bucket '{path}': {source}")]
    Codec {
        path: HistoryPath,
        source: serde_json::Error,
    },

    #[error("Blob {0} not found")]
    BlobNotFound(Uuid),

    #[error("State of '{path}' at {timestamp} no longer exists")]
    StateNotFound { path: HistoryPath, timestamp: i64 },
}

impl HistoryError {
    pub(crate) fn storage(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HistoryError::Storage {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn database(context: impl ToString, source: sled::Error) -> Self {
        HistoryError::Database {
            context: context.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HistoryError::BlobNotFound(_) | HistoryError::StateNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;
