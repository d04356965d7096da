//! Error types for the minikv storage engine

use thiserror::Error;

use crate::storage::checksum::ChecksumError;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Store is closed")]
    Closed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<ChecksumError> for StorageError {
    fn from(err: ChecksumError) -> Self {
        match err {
            ChecksumError::Io(e) => StorageError::Io(e),
            other => StorageError::Corruption(other.to_string()),
        }
    }
}
