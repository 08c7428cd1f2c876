//! Isolated controller environment for integration tests.
//!
//! `TestHarness` owns a temp directory holding the artifact store and
//! credential scratch space, an in-memory cluster and a reconciler wired to
//! both.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use helmsource::source::{
    FetcherSettings, ReconcilerSettings, ResourceStore, SchedulerSettings, HELM_REPOSITORY_KIND,
};
use helmsource::{
    ArtifactStorage, HelmRepository, HelmRepositoryReconciler, InMemoryCluster, IndexFetcher,
    NamespacedName, Scheduler,
};
use tempfile::TempDir;

/// Everything a scenario needs, rooted in one temp directory.
pub struct TestHarness {
    pub dir: TempDir,
    pub cluster: Arc<InMemoryCluster>,
    pub storage: Arc<ArtifactStorage>,
    pub reconciler: Arc<HelmRepositoryReconciler>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_retry(Duration::from_secs(60))
    }

    pub fn with_retry(retry_interval: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let storage = Arc::new(
            ArtifactStorage::new(
                dir.path().join("artifacts"),
                "source-controller.local",
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let reconciler = Arc::new(HelmRepositoryReconciler::new(
            cluster.clone(),
            cluster.clone(),
            storage.clone(),
            IndexFetcher::new(FetcherSettings {
                timeout: Duration::from_secs(5),
                ..Default::default()
            }),
            ReconcilerSettings {
                retry_interval,
                credentials_dir: Some(dir.path().join("credentials")),
            },
        ));
        std::fs::create_dir_all(dir.path().join("credentials")).unwrap();

        Self {
            dir,
            cluster,
            storage,
            reconciler,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.reconciler.clone(),
            SchedulerSettings {
                concurrency: 2,
                resync_interval: None,
            },
        )
    }

    pub async fn apply(&self, repository: HelmRepository) -> NamespacedName {
        self.cluster.apply(repository).await.unwrap().key()
    }

    pub async fn get(&self, key: &NamespacedName) -> Option<HelmRepository> {
        self.cluster.get(key).await.unwrap()
    }

    /// Files currently stored for a repository, relative to the storage root.
    pub fn stored_files(&self, key: &NamespacedName) -> Vec<String> {
        let relative = self
            .storage
            .resource_dir(HELM_REPOSITORY_KIND, key)
            .unwrap();
        let dir = self.storage.base_path().join(relative);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut files: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        files
    }
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
