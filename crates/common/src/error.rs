//! Error types for the ParaBank harness

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(
        "Config file {} not found. Copy {} to it and update the values",
        .path.display(),
        .example.display()
    )]
    ConfigNotFound { path: PathBuf, example: PathBuf },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid storage state: {0}")]
    InvalidStorageState(String),
}
