//! Error types for the ipmaps crate.

use thiserror::Error;

use crate::packages::PackageMapError;

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("Package map error: {0}")]
    Packages(#[from] PackageMapError),

    #[error("Directory error: {0}")]
    Directory(#[from] ipmaps_directory::DirectoryError),

    #[error("All {failed} lease ranges failed, no lease data collected")]
    NoLeaseData { failed: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CollectError>;
