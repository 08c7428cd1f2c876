//! Secrets: the field map handed to the credential resolver, and the sources
//! a declared secret field can be read from.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use secrecy::SecretSlice;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("none of value, file or envVar is set")]
    Unset,

    #[error("failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("environment variable '{0}' is not valid UTF-8")]
    InvalidEnvVar(String),
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// A named field -> bytes mapping, as held by the secret store.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    /// Adds a field, returning the secret for chaining.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// Returns the field only when it is present and non-empty.
    pub fn non_empty(&self, key: &str) -> Option<&[u8]> {
        self.get(key).filter(|v| !v.is_empty())
    }
}

impl fmt::Debug for Secret {
    // Field values never reach logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Where a declared secret field takes its value from.
///
/// Sources are tried in order and the first one set wins:
///
/// 1. **value** - inline, for local testing
/// 2. **file** - mounted secrets such as `/run/secrets/repo-password`
/// 3. **envVar** - injected by the process environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSource {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
}

impl ValueSource {
    pub fn is_set(&self) -> bool {
        [&self.value, &self.file, &self.env_var]
            .iter()
            .any(|s| s.as_deref().is_some_and(|s| !s.is_empty()))
    }

    /// Reads the value. A single trailing line ending is dropped from file
    /// and environment values; PEM bodies are otherwise kept byte for byte.
    pub fn resolve(&self) -> Result<SecretSlice<u8>> {
        if let Some(value) = non_empty(&self.value) {
            return Ok(value.as_bytes().to_vec().into());
        }

        if let Some(path) = non_empty(&self.file) {
            let path = PathBuf::from(expand_home(path));
            let mut bytes = std::fs::read(&path).map_err(|e| SecretError::ReadFile {
                path: path.clone(),
                source: e,
            })?;
            strip_line_ending(&mut bytes);
            return Ok(bytes.into());
        }

        if let Some(name) = non_empty(&self.env_var) {
            let mut bytes = std::env::var(name)
                .map_err(|e| match e {
                    std::env::VarError::NotPresent => SecretError::MissingEnvVar(name.to_string()),
                    std::env::VarError::NotUnicode(_) => {
                        SecretError::InvalidEnvVar(name.to_string())
                    }
                })?
                .into_bytes();
            strip_line_ending(&mut bytes);
            return Ok(bytes.into());
        }

        Err(SecretError::Unset)
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

fn strip_line_ending(bytes: &mut Vec<u8>) {
    if bytes.ends_with(b"\n") {
        bytes.pop();
        if bytes.ends_with(b"\r") {
            bytes.pop();
        }
    }
}

/// Expands `~` and `~/...` to the user's home directory.
///
/// `~user/path` is not supported.
pub(crate) fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            if path == "~" {
                return home.to_string_lossy().into_owned();
            }
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
