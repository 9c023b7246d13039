use std::io;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while reading or rewriting the WAL catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A catalog line could not be parsed. The file is left as is.
    #[error("catalog corrupted at line {line}: {reason} ({content:?})")]
    Corruption {
        line: usize,
        content: String,
        reason: String,
    },

    /// A record that cannot be written as a single catalog line.
    #[error("invalid WAL record {name:?}: {reason}")]
    InvalidRecord { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("cannot reach object store: {source}")]
    Connectivity {
        #[source]
        source: BoxError,
    },

    #[error("object of {size} bytes exceeds the {limit} bytes limit")]
    ObjectTooLarge { size: u64, limit: u64 },

    /// Raised once the session has already been aborted; `source` is the
    /// failure that caused the abort.
    #[error("upload of {key} failed: {source}")]
    UploadFailed {
        key: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("multipart upload of {key} is already {state}")]
    SessionFinished { key: String, state: String },

    #[error("multipart upload of {key} is missing parts {missing:?}")]
    IncompleteUpload { key: String, missing: Vec<u32> },

    #[error("invalid part for {key}: {reason}")]
    InvalidPart { key: String, reason: String },

    #[error("{operation} failed: {source}")]
    Provider {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn provider(operation: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Provider {
            operation,
            source: source.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Failures of the archive pipeline, which touches both stores.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("catalog task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
