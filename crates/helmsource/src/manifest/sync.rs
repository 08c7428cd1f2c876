//! Applies the declared manifest set to the in-process cluster.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::loader::{ManifestLoader, ManifestSet};
use super::{ManifestError, Result};
use crate::source::cluster::InMemoryCluster;
use crate::source::resource::NamespacedName;

/// Counts of what a sync changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub repositories_applied: usize,
    pub repositories_deleted: usize,
    pub secrets_applied: usize,
    pub secrets_deleted: usize,
}

#[derive(Default)]
struct Applied {
    repositories: HashSet<NamespacedName>,
    secrets: HashSet<NamespacedName>,
}

/// Keeps the cluster in line with the manifest directory.
///
/// Only resources this sync applied earlier are ever deleted; anything put
/// into the cluster by other means is left alone.
pub struct ManifestSync {
    loader: ManifestLoader,
    cluster: Arc<InMemoryCluster>,
    applied: Mutex<Applied>,
}

impl ManifestSync {
    pub fn new(loader: ManifestLoader, cluster: Arc<InMemoryCluster>) -> Self {
        Self {
            loader,
            cluster,
            applied: Mutex::new(Applied::default()),
        }
    }

    pub fn loader(&self) -> &ManifestLoader {
        &self.loader
    }

    /// Loads the directory and applies it. On a load error the cluster is
    /// left untouched.
    pub async fn sync(&self) -> Result<SyncSummary> {
        let loader = self.loader.clone();
        let set = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| ManifestError::WatchError(format!("manifest load task failed: {}", e)))??;
        self.apply(set).await
    }

    /// Applies a loaded set: secrets first, then repositories, then deletions.
    pub async fn apply(&self, set: ManifestSet) -> Result<SyncSummary> {
        let mut applied = self.applied.lock().await;
        let mut summary = SyncSummary::default();

        let secret_keys = set.secret_keys();
        let repository_keys = set.repository_keys();

        for secret in set.secrets {
            self.cluster.apply_secret(secret.resource).await?;
            summary.secrets_applied += 1;
        }
        for repository in set.repositories {
            self.cluster.apply(repository.resource).await?;
            summary.repositories_applied += 1;
        }

        for key in applied.repositories.difference(&repository_keys) {
            if self.cluster.delete(key).await? {
                log::info!("Deleting HelmRepository {} (no longer declared)", key);
                summary.repositories_deleted += 1;
            }
        }
        for key in applied.secrets.difference(&secret_keys) {
            if self.cluster.delete_secret(&key.namespace, &key.name).await? {
                log::info!("Deleting Secret {} (no longer declared)", key);
                summary.secrets_deleted += 1;
            }
        }

        applied.repositories = repository_keys;
        applied.secrets = secret_keys;
        Ok(summary)
    }
}
