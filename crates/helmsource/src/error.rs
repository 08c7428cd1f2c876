use std::path::PathBuf;

use thiserror::Error;

use crate::manifest::ManifestError;
use crate::source::{ClusterError, SourceError};
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum HelmSourceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("No config path given and no platform config directory available")]
    NoConfigPath,
}

pub type Result<T> = std::result::Result<T, HelmSourceError>;
