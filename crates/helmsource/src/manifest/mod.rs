//! Declarative manifests for the in-process cluster.
//!
//! - Multi-file, multi-document YAML loading (`HelmRepository` and `Secret`)
//! - Syncing the declared set into an [`InMemoryCluster`](crate::source::InMemoryCluster)
//! - Watching the manifest directory for changes

pub mod loader;
pub mod sync;
pub mod watcher;

use std::path::PathBuf;

use thiserror::Error;

use crate::secrets::SecretError;
use crate::source::ClusterError;

pub use loader::{ManifestDocument, ManifestLoader, ManifestSet, ResourceWithPath, SecretManifest};
pub use sync::{ManifestSync, SyncSummary};
pub use watcher::ManifestWatcher;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Invalid resource in '{path}': {message}")]
    InvalidResource { path: PathBuf, message: String },

    #[error("Invalid API version '{version}' for kind '{kind}' in '{path}', expected '{expected}'")]
    InvalidApiVersion {
        path: PathBuf,
        kind: String,
        version: String,
        expected: String,
    },

    #[error("Unknown resource kind '{kind}' in '{path}'")]
    UnknownKind { path: PathBuf, kind: String },

    #[error("Duplicate {kind} '{name}'")]
    DuplicateName { kind: String, name: String },

    #[error("Failed to resolve field '{field}' of secret '{name}': {source}")]
    SecretField {
        name: String,
        field: String,
        #[source]
        source: SecretError,
    },

    #[error("Field '{field}' of secret '{name}' is not valid base64: {message}")]
    InvalidBase64 {
        name: String,
        field: String,
        message: String,
    },

    #[error("Failed to apply manifest: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Watch error: {0}")]
    WatchError(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;
