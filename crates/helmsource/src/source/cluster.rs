//! Cluster-state and secret store contracts, and an in-process implementation.
//!
//! The engine only talks to the traits. [`InMemoryCluster`] backs the
//! controller binary (fed from manifests) and the tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use super::resource::{HelmRepository, HelmRepositoryStatus, NamespacedName, HELM_REPOSITORY_KIND};
use crate::secrets::Secret;

/// Capacity of the watch event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("resource '{0}' not found")]
    NotFound(NamespacedName),

    #[error("invalid resource: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Change notifications emitted by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A resource was created or its spec or metadata changed.
    Applied(NamespacedName),
    /// Deletion was requested, or the record is gone.
    Deleted(NamespacedName),
    /// A secret was created, changed or removed.
    SecretChanged { namespace: String, name: String },
}

/// Persistence and watch contract for managed resources.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &NamespacedName) -> Result<Option<HelmRepository>>;

    async fn list(&self) -> Result<Vec<HelmRepository>>;

    /// Replaces the status of the resource. Spec and metadata are untouched.
    async fn update_status(&self, key: &NamespacedName, status: HelmRepositoryStatus)
        -> Result<()>;

    async fn add_finalizer(&self, key: &NamespacedName, finalizer: &str) -> Result<()>;

    /// Removes a finalizer. A resource pending deletion disappears once its
    /// last finalizer is gone.
    async fn remove_finalizer(&self, key: &NamespacedName, finalizer: &str) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Read access to credential secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

#[derive(Default)]
struct ClusterState {
    repositories: BTreeMap<NamespacedName, HelmRepository>,
    secrets: BTreeMap<NamespacedName, Secret>,
}

/// In-process cluster holding resources and secrets in memory.
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(ClusterState::default()),
            events,
        }
    }

    /// Creates or updates a resource from its declared form.
    ///
    /// Status, finalizers and the deletion timestamp of an existing record are
    /// preserved. The generation is bumped only when the spec changes.
    pub async fn apply(&self, mut repository: HelmRepository) -> Result<HelmRepository> {
        if repository.metadata.name.is_empty() {
            return Err(ClusterError::Invalid("metadata.name is required".to_string()));
        }
        if repository.kind != HELM_REPOSITORY_KIND {
            return Err(ClusterError::Invalid(format!(
                "unsupported kind '{}'",
                repository.kind
            )));
        }

        let key = repository.key();
        let mut state = self.state.write().await;

        let (stored, changed) = match state.repositories.get_mut(&key) {
            Some(existing) => {
                let spec_changed = existing.spec != repository.spec;
                let meta_changed = existing.metadata.labels != repository.metadata.labels
                    || existing.metadata.annotations != repository.metadata.annotations;

                if spec_changed {
                    existing.spec = repository.spec;
                    existing.metadata.generation += 1;
                }
                if meta_changed {
                    existing.metadata.labels = repository.metadata.labels;
                    existing.metadata.annotations = repository.metadata.annotations;
                }
                (existing.clone(), spec_changed || meta_changed)
            }
            None => {
                repository.metadata.generation = 1;
                repository.metadata.deletion_timestamp = None;
                repository.status = HelmRepositoryStatus::default();
                state.repositories.insert(key.clone(), repository.clone());
                (repository, true)
            }
        };
        drop(state);

        if changed {
            log::debug!("Applied {} {}", HELM_REPOSITORY_KIND, key);
            self.emit(WatchEvent::Applied(key));
        }
        Ok(stored)
    }

    /// Requests deletion of a resource.
    ///
    /// Returns false when the resource does not exist. With finalizers
    /// remaining the record stays, marked with a deletion timestamp.
    pub async fn delete(&self, key: &NamespacedName) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(existing) = state.repositories.get_mut(key) else {
            return Ok(false);
        };

        if existing.metadata.finalizers.is_empty() {
            state.repositories.remove(key);
        } else if existing.metadata.deletion_timestamp.is_none() {
            existing.metadata.deletion_timestamp = Some(Utc::now());
        }
        drop(state);

        self.emit(WatchEvent::Deleted(key.clone()));
        Ok(true)
    }

    /// Creates or replaces a secret.
    pub async fn apply_secret(&self, secret: Secret) -> Result<()> {
        if secret.name.is_empty() {
            return Err(ClusterError::Invalid("secret name is required".to_string()));
        }

        let key = NamespacedName::new(&secret.namespace, &secret.name);
        let mut state = self.state.write().await;
        if state.secrets.get(&key) == Some(&secret) {
            return Ok(());
        }
        state.secrets.insert(key.clone(), secret);
        drop(state);

        self.emit(WatchEvent::SecretChanged {
            namespace: key.namespace,
            name: key.name,
        });
        Ok(())
    }

    /// Removes a secret. Returns false when it did not exist.
    pub async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool> {
        let key = NamespacedName::new(namespace, name);
        let removed = self.state.write().await.secrets.remove(&key).is_some();
        if removed {
            self.emit(WatchEvent::SecretChanged {
                namespace: key.namespace,
                name: key.name,
            });
        }
        Ok(removed)
    }

    pub async fn list_secrets(&self) -> Vec<NamespacedName> {
        self.state.read().await.secrets.keys().cloned().collect()
    }

    fn emit(&self, event: WatchEvent) {
        if let Err(e) = self.events.send(event) {
            log::debug!("No watch subscribers active: {:?}", e.0);
        }
    }
}

#[async_trait]
impl ResourceStore for InMemoryCluster {
    async fn get(&self, key: &NamespacedName) -> Result<Option<HelmRepository>> {
        Ok(self.state.read().await.repositories.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<HelmRepository>> {
        Ok(self.state.read().await.repositories.values().cloned().collect())
    }

    async fn update_status(
        &self,
        key: &NamespacedName,
        status: HelmRepositoryStatus,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let existing = state
            .repositories
            .get_mut(key)
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        existing.status = status;
        Ok(())
    }

    async fn add_finalizer(&self, key: &NamespacedName, finalizer: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let existing = state
            .repositories
            .get_mut(key)
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        if !existing.metadata.has_finalizer(finalizer) {
            existing.metadata.finalizers.push(finalizer.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, key: &NamespacedName, finalizer: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let existing = state
            .repositories
            .get_mut(key)
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        existing.metadata.finalizers.retain(|f| f != finalizer);

        if existing.metadata.is_being_deleted() && existing.metadata.finalizers.is_empty() {
            state.repositories.remove(key);
            drop(state);
            log::debug!("Removed {} {}", HELM_REPOSITORY_KIND, key);
            self.emit(WatchEvent::Deleted(key.clone()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl SecretStore for InMemoryCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let key = NamespacedName::new(namespace, name);
        Ok(self.state.read().await.secrets.get(&key).cloned())
    }
}
