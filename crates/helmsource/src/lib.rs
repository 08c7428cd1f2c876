pub mod config;
pub mod error;
pub mod manifest;
pub mod secrets;
pub mod source;
pub mod storage;

pub use config::{load_config, resolve_config_path, ControllerConfig};
pub use error::{ConfigError, HelmSourceError, Result};
pub use manifest::{ManifestError, ManifestLoader, ManifestSync, ManifestWatcher};
pub use secrets::{Secret, SecretError, ValueSource};
pub use source::{
    HelmRepository, HelmRepositoryReconciler, InMemoryCluster, IndexFetcher, NamespacedName,
    Scheduler, SourceError,
};
pub use storage::{ArtifactStorage, StorageError};
