pub mod artifact;

use std::path::PathBuf;

use thiserror::Error;

use crate::source::resource::Interval;

pub use artifact::{checksum, ArtifactStorage, GcSummary, TEMP_DIR};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid artifact path segment '{0}'")]
    InvalidPath(String),

    #[error("Storage {operation} exceeded its {timeout} deadline")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Interval,
    },

    #[error("Checksum mismatch for '{path}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;
