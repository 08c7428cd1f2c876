//! Source reconciliation error types.

use thiserror::Error;

use super::cluster::ClusterError;
use super::credentials::CredentialError;
use super::fetcher::FetchError;
use super::resource::{
    AUTHENTICATION_FAILED_REASON, INDEXATION_FAILED_REASON, INDEX_VALIDATION_FAILED_REASON,
};
use crate::storage::StorageError;

/// Errors that end a reconciliation pass early.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{0}")]
    Credentials(#[from] CredentialError),

    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Cluster(#[from] ClusterError),

    #[error("blocking task failed: {0}")]
    Task(String),
}

impl SourceError {
    /// Returns true if the error is likely transient and a retry may succeed
    /// without any change to the spec or the referenced secret.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Credentials(CredentialError::WriteFile { .. }) => true,
            SourceError::Credentials(_) => false,
            SourceError::Fetch(e) => e.is_retryable(),
            SourceError::Storage(_)
            | SourceError::Cluster(_)
            | SourceError::Task(_) => true,
        }
    }

    /// The stable condition reason reported for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            SourceError::Credentials(CredentialError::WriteFile { .. }) => {
                INDEXATION_FAILED_REASON
            }
            SourceError::Credentials(_) => AUTHENTICATION_FAILED_REASON,
            SourceError::Fetch(FetchError::Unauthorized { .. }) => AUTHENTICATION_FAILED_REASON,
            SourceError::Fetch(FetchError::TooLarge { .. })
            | SourceError::Fetch(FetchError::InvalidIndex(_)) => INDEX_VALIDATION_FAILED_REASON,
            SourceError::Fetch(_)
            | SourceError::Storage(_)
            | SourceError::Cluster(_)
            | SourceError::Task(_) => INDEXATION_FAILED_REASON,
        }
    }
}

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;
