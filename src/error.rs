use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Request failed: {0}")]
    Transient(#[from] reqwest::Error),

    #[error("Download truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SyncError {
    /// Only network and stream failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transient(err) => !err.is_builder() && !err.is_redirect(),
            SyncError::Truncated { .. } => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to parse catalog file: {0}")]
    ParseError(String),

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Data not ready: {0}")]
    NotReady(String),

    #[error("Query engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    #[error("Failed to load {}: {message}", path.display())]
    Load { path: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}
