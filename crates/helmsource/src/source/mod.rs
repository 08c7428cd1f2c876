//! HelmRepository sources.
//!
//! - Credential resolution from referenced secrets
//! - Index fetching over HTTP(S)
//! - The reconciler and the per-resource scheduler driving it
//! - Cluster and secret store contracts with an in-memory implementation

pub mod cluster;
pub mod credentials;
pub mod error;
pub mod fetcher;
pub mod reconciler;
pub mod resource;
pub mod scheduler;

pub use cluster::{ClusterError, InMemoryCluster, ResourceStore, SecretStore, WatchEvent};
pub use credentials::{
    client_options_from_secret, client_options_from_secret_in, CredentialError,
    ResolvedCredentials, TransportOption,
};
pub use error::{Result, SourceError};
pub use fetcher::{FetchError, FetchedIndex, FetcherSettings, IndexFetcher};
pub use reconciler::{HelmRepositoryReconciler, ReconcileOutcome, ReconcilerSettings};
pub use resource::{
    Artifact, Condition, ConditionStatus, HelmRepository, HelmRepositorySpec,
    HelmRepositoryStatus, Interval, LocalObjectReference, NamespacedName, ObjectMeta, API_VERSION,
    AUTHENTICATION_FAILED_REASON, HELM_REPOSITORY_KIND, INDEXATION_FAILED_REASON,
    INDEXATION_SUCCEEDED_REASON, INDEX_VALIDATION_FAILED_REASON, READY_CONDITION,
    SOURCE_FINALIZER,
};
pub use scheduler::{Scheduler, SchedulerSettings};
