//! HelmRepository reconciler: credentials → fetch → publish → status.
//!
//! One pass per call. Callers guarantee that passes for the same resource never
//! overlap; the scheduler enforces this.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};

use super::cluster::{ResourceStore, SecretStore};
use super::credentials::{client_options_from_secret_in, CredentialError, ResolvedCredentials};
use super::error::{Result, SourceError};
use super::fetcher::IndexFetcher;
use super::resource::{
    Artifact, HelmRepository, NamespacedName, HELM_REPOSITORY_KIND, INDEXATION_SUCCEEDED_REASON,
    SOURCE_FINALIZER,
};
use crate::storage::{checksum, ArtifactStorage, StorageError};

/// Default delay before retrying a failed pass.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// What the scheduler should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Run again after the given delay.
    Requeue(Duration),
    /// Nothing scheduled; only a watch event triggers the next pass.
    Done,
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub retry_interval: Duration,
    /// Where TLS material is written for the duration of a fetch.
    /// Defaults to the system temp directory.
    pub credentials_dir: Option<PathBuf>,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            credentials_dir: None,
        }
    }
}

/// Result of a successful sync, before it is written to the status.
struct Synced {
    artifact: Artifact,
    url: String,
}

/// Reconciles `HelmRepository` resources into artifacts.
pub struct HelmRepositoryReconciler {
    resources: Arc<dyn ResourceStore>,
    secrets: Arc<dyn SecretStore>,
    storage: Arc<ArtifactStorage>,
    fetcher: IndexFetcher,
    settings: ReconcilerSettings,
}

impl HelmRepositoryReconciler {
    pub fn new(
        resources: Arc<dyn ResourceStore>,
        secrets: Arc<dyn SecretStore>,
        storage: Arc<ArtifactStorage>,
        fetcher: IndexFetcher,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            resources,
            secrets,
            storage,
            fetcher,
            settings,
        }
    }

    pub fn resources(&self) -> &Arc<dyn ResourceStore> {
        &self.resources
    }

    pub fn storage(&self) -> &Arc<ArtifactStorage> {
        &self.storage
    }

    pub fn retry_interval(&self) -> Duration {
        self.settings.retry_interval
    }

    /// Runs one pass for `key`.
    ///
    /// Source failures end up in the Ready condition and yield a requeue. An
    /// `Err` means the pass could not record its result (cluster write or
    /// finalization failure) and should be retried.
    pub async fn reconcile(&self, key: &NamespacedName) -> Result<ReconcileOutcome> {
        let span = info_span!("reconcile", kind = HELM_REPOSITORY_KIND, resource = %key);
        self.reconcile_inner(key).instrument(span).await
    }

    async fn reconcile_inner(&self, key: &NamespacedName) -> Result<ReconcileOutcome> {
        let Some(repository) = self.resources.get(key).await? else {
            debug!("Resource no longer exists");
            return Ok(ReconcileOutcome::Done);
        };

        if repository.metadata.is_being_deleted() {
            return self.finalize(&repository).await;
        }

        if !repository.metadata.has_finalizer(SOURCE_FINALIZER) {
            self.resources.add_finalizer(key, SOURCE_FINALIZER).await?;
        }

        let interval = repository.interval();
        let mut status = match self.sync(&repository).await {
            Ok(synced) => {
                let message = format!("Fetched revision: {}", synced.artifact.revision);
                info!(revision = %synced.artifact.revision, "{}", message);
                repository.status.clone().into_ready(
                    synced.artifact,
                    synced.url,
                    INDEXATION_SUCCEEDED_REASON,
                    message,
                )
            }
            Err(e) => {
                warn!(reason = e.reason(), retryable = e.is_retryable(), "Reconcile failed: {}", e);
                repository.status.clone().into_not_ready(e.reason(), e.to_string())
            }
        };
        status.observed_generation = repository.metadata.generation;

        let ready = status.is_ready();
        let keep = status.artifact.as_ref().map(|a| a.path.clone());
        self.resources.update_status(key, status).await?;

        // Collected only once the status points at the kept artifact.
        if ready {
            self.collect_garbage(key, keep).await;
        }

        Ok(self.requeue_after(ready, interval))
    }

    async fn sync(&self, repository: &HelmRepository) -> Result<Synced> {
        let key = repository.key();

        let credentials = self.resolve_credentials(repository).await?;
        let fetched = self.fetcher.fetch(&repository.spec.url, &credentials).await?;
        drop(credentials);

        let revision = checksum(&fetched.payload);

        if let Some(current) = repository.artifact().filter(|a| a.revision == revision) {
            let candidate = current.clone();
            if self.blocking(move |s| s.exists(&candidate)).await? {
                debug!(revision = %revision, "Index unchanged");
                return Ok(Synced {
                    artifact: current.clone(),
                    url: fetched.url,
                });
            }
            info!(revision = %revision, "Stored artifact missing or corrupt, republishing");
        }

        let artifact = self
            .storage
            .artifact_for(HELM_REPOSITORY_KIND, &key, &revision)?;
        let payload = fetched.payload;
        let artifact = self
            .blocking(move |s| s.publish(&artifact, &payload))
            .await??;

        Ok(Synced {
            artifact,
            url: fetched.url,
        })
    }

    async fn resolve_credentials(&self, repository: &HelmRepository) -> Result<ResolvedCredentials> {
        let Some(secret_ref) = &repository.spec.secret_ref else {
            return Ok(ResolvedCredentials::none());
        };

        let namespace = &repository.metadata.namespace;
        let secret = self
            .secrets
            .get_secret(namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| {
                CredentialError::SecretNotFound(format!("{}/{}", namespace, secret_ref.name))
            })?;

        let dir = self
            .settings
            .credentials_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let resolved = self
            .blocking(move |_| client_options_from_secret_in(&secret, &dir))
            .await??;
        Ok(resolved)
    }

    async fn finalize(&self, repository: &HelmRepository) -> Result<ReconcileOutcome> {
        let key = repository.key();
        info!("Removing artifacts before deletion");

        let gc_key = key.clone();
        match self
            .blocking(move |s| s.remove_all(HELM_REPOSITORY_KIND, &gc_key))
            .await?
        {
            Ok(summary) if !summary.is_clean() => {
                warn!(
                    failures = summary.failures.len(),
                    "Artifact cleanup incomplete, keeping finalizer"
                );
                return Ok(ReconcileOutcome::Requeue(self.settings.retry_interval));
            }
            Ok(summary) => debug!(removed = summary.removed.len(), "Artifacts removed"),
            // Nothing can have been stored under a path that does not validate.
            Err(StorageError::InvalidPath(segment)) => {
                debug!(segment = %segment, "No artifact directory for resource")
            }
            Err(e) => return Err(e.into()),
        }

        if repository.metadata.has_finalizer(SOURCE_FINALIZER) {
            self.resources.remove_finalizer(&key, SOURCE_FINALIZER).await?;
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn collect_garbage(&self, key: &NamespacedName, keep: Option<String>) {
        let gc_key = key.clone();
        let result = self
            .blocking(move |s| s.garbage_collect(HELM_REPOSITORY_KIND, &gc_key, keep.as_deref()))
            .await;
        match result {
            Ok(Ok(summary)) if summary.is_clean() => {
                if !summary.removed.is_empty() {
                    debug!(removed = summary.removed.len(), "Garbage collected artifacts");
                }
            }
            Ok(Ok(summary)) => warn!(
                failures = summary.failures.len(),
                "Garbage collection incomplete"
            ),
            Ok(Err(e)) => warn!("Garbage collection failed: {}", e),
            Err(e) => warn!("Garbage collection failed: {}", e),
        }
    }

    fn requeue_after(&self, ready: bool, interval: Duration) -> ReconcileOutcome {
        match (ready, interval.is_zero()) {
            (true, true) => ReconcileOutcome::Done,
            (true, false) => ReconcileOutcome::Requeue(interval),
            (false, true) => ReconcileOutcome::Requeue(self.settings.retry_interval),
            (false, false) => {
                ReconcileOutcome::Requeue(self.settings.retry_interval.min(interval))
            }
        }
    }

    /// Runs blocking disk work on the blocking pool.
    ///
    /// Store operations give up on their own once the I/O timeout passes.
    /// Blocking work cannot be cancelled, so an overrun is waited out: the pass
    /// never ends while its disk work is still running.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ArtifactStorage) -> T + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        let timeout = storage.io_timeout();
        let mut handle = tokio::task::spawn_blocking(move || f(&storage));

        let joined = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    timeout = ?timeout,
                    "Storage operation overran its deadline, waiting for it to stop"
                );
                handle.await
            }
        };
        joined.map_err(|e| SourceError::Task(e.to_string()))
    }
}
