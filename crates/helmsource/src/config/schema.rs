use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::secrets::expand_home;
use crate::source::fetcher::{FetcherSettings, DEFAULT_MAX_INDEX_SIZE};
use crate::source::reconciler::{ReconcilerSettings, DEFAULT_RETRY_INTERVAL};
use crate::source::resource::Interval;
use crate::source::scheduler::{SchedulerSettings, DEFAULT_CONCURRENCY};

/// Top-level controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub manifests: ManifestsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Root of the artifact store; `~` is expanded.
    pub path: String,
    /// Host (and optional port) the file server answers on.
    pub hostname: String,
    /// Bound on a single publish or garbage collection run.
    #[serde(default = "default_storage_timeout")]
    pub timeout: Interval,
}

fn default_storage_timeout() -> Interval {
    Interval::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerConfig {
    #[serde(default = "default_retry_interval")]
    pub retry_interval: Interval,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: Interval,
    #[serde(default = "default_max_index_size")]
    pub max_index_size: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_interval: Option<Interval>,
    /// Where TLS material is written during a fetch. System temp dir if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_dir: Option<String>,
}

fn default_retry_interval() -> Interval {
    Interval(DEFAULT_RETRY_INTERVAL)
}

fn default_fetch_timeout() -> Interval {
    Interval::from_secs(60)
}

fn default_max_index_size() -> u64 {
    DEFAULT_MAX_INDEX_SIZE
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry_interval: default_retry_interval(),
            fetch_timeout: default_fetch_timeout(),
            max_index_size: default_max_index_size(),
            concurrency: default_concurrency(),
            resync_interval: None,
            credentials_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestsConfig {
    /// Directory of HelmRepository and Secret manifests. Nothing is loaded if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default = "default_true")]
    pub watch: bool,
    #[serde(default = "default_debounce")]
    pub debounce: Interval,
}

fn default_true() -> bool {
    true
}

fn default_debounce() -> Interval {
    Interval(Duration::from_millis(500))
}

impl Default for ManifestsConfig {
    fn default() -> Self {
        Self {
            directory: None,
            watch: true,
            debounce: default_debounce(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ControllerConfig {
    pub fn storage_path(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.storage.path))
    }

    pub fn manifest_directory(&self) -> Option<PathBuf> {
        self.manifests
            .directory
            .as_deref()
            .map(|d| PathBuf::from(expand_home(d)))
    }

    pub fn fetcher_settings(&self) -> FetcherSettings {
        FetcherSettings {
            timeout: self.reconciler.fetch_timeout.as_duration(),
            max_index_size: self.reconciler.max_index_size,
            ..Default::default()
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            retry_interval: self.reconciler.retry_interval.as_duration(),
            credentials_dir: self
                .reconciler
                .credentials_dir
                .as_deref()
                .map(|d| PathBuf::from(expand_home(d))),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            concurrency: self.reconciler.concurrency,
            resync_interval: self.reconciler.resync_interval.map(|i| i.as_duration()),
        }
    }
}
