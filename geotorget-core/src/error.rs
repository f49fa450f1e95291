//! Error types for geotorget-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the Manifest Store and configuration files.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (write path).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error (config write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A persisted document exists but could not be parsed.
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// `config init` refuses to clobber an existing file.
    #[error("config already exists at {path}")]
    ConfigExists { path: PathBuf },
}

/// Errors from interpreting remote order listings and identifiers.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("'{0}' is not a valid order id (expected a UUID)")]
    InvalidOrderId(String),

    #[error("malformed order listing: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("order listing contains unsafe file name '{0}'")]
    UnsafeFileName(String),

    #[error("order listing contains duplicate file name '{0}'")]
    DuplicateFileName(String),
}

/// Convenience constructor for [`StoreError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
