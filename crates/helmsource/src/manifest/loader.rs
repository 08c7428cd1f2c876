//! Loads `HelmRepository` and `Secret` manifests from a directory tree.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use secrecy::ExposeSecret;
use serde::Deserialize;
use walkdir::{DirEntry, WalkDir};

use super::{ManifestError, Result};
use crate::secrets::{Secret, ValueSource};
use crate::source::resource::{
    HelmRepository, NamespacedName, ObjectMeta, API_VERSION, HELM_REPOSITORY_KIND,
};

/// API version accepted for secrets.
pub const SECRET_API_VERSION: &str = "v1";
pub const SECRET_KIND: &str = "Secret";

/// A resource paired with the file it was loaded from.
#[derive(Debug, Clone)]
pub struct ResourceWithPath<T> {
    pub resource: T,
    pub path: PathBuf,
}

/// One document of a manifest file.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    HelmRepository(HelmRepository),
    Secret(Secret),
}

/// Everything declared under the manifest directory.
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    pub repositories: Vec<ResourceWithPath<HelmRepository>>,
    pub secrets: Vec<ResourceWithPath<Secret>>,
}

impl ManifestSet {
    pub fn repository_keys(&self) -> HashSet<NamespacedName> {
        self.repositories.iter().map(|r| r.resource.key()).collect()
    }

    pub fn secret_keys(&self) -> HashSet<NamespacedName> {
        self.secrets
            .iter()
            .map(|s| NamespacedName::new(&s.resource.namespace, &s.resource.name))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ResourceHeader {
    #[serde(default, rename = "apiVersion")]
    api_version: String,
    #[serde(default)]
    kind: String,
}

/// A secret field given in `stringData`: a plain string or a [`ValueSource`].
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    Literal(String),
    Source(ValueSource),
}

/// The declared form of a secret.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    /// Base64-encoded values.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Plain or referenced values; these win over `data` for the same key.
    #[serde(default)]
    pub string_data: BTreeMap<String, SecretValue>,
}

impl SecretManifest {
    pub fn into_secret(self) -> Result<Secret> {
        let name = format!("{}/{}", self.metadata.namespace, self.metadata.name);
        let mut secret = Secret::new(self.metadata.namespace, self.metadata.name);

        for (field, encoded) in self.data {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| ManifestError::InvalidBase64 {
                    name: name.clone(),
                    field: field.clone(),
                    message: e.to_string(),
                })?;
            secret.data.insert(field, decoded);
        }

        for (field, value) in self.string_data {
            let resolved = match value {
                SecretValue::Literal(value) => value.into_bytes(),
                SecretValue::Source(source) => source
                    .resolve()
                    .map_err(|e| ManifestError::SecretField {
                        name: name.clone(),
                        field: field.clone(),
                        source: e,
                    })?
                    .expose_secret()
                    .to_vec(),
            };
            secret.data.insert(field, resolved);
        }

        Ok(secret)
    }
}

/// Manifest loader for a directory tree.
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    manifest_dir: PathBuf,
}

impl ManifestLoader {
    pub fn new(manifest_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest_dir: manifest_dir.into(),
        }
    }

    pub fn manifest_dir(&self) -> &Path {
        &self.manifest_dir
    }

    /// Loads every `*.yaml`/`*.yml` file under the directory.
    ///
    /// Hidden files and directories are skipped. Fails on the first invalid
    /// document and on duplicate resources.
    pub fn load(&self) -> Result<ManifestSet> {
        let mut set = ManifestSet::default();
        let mut seen_repositories = HashSet::new();
        let mut seen_secrets = HashSet::new();

        let walker = WalkDir::new(&self.manifest_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

        for entry in walker {
            let entry = entry.map_err(|e| ManifestError::ReadDirectory {
                path: self.manifest_dir.clone(),
                source: e,
            })?;
            if !entry.file_type().is_file() || !is_manifest_file(entry.path()) {
                continue;
            }

            let path = entry.path();
            for document in self.load_file(path)? {
                match document {
                    ManifestDocument::HelmRepository(repository) => {
                        if !seen_repositories.insert(repository.key()) {
                            return Err(ManifestError::DuplicateName {
                                kind: HELM_REPOSITORY_KIND.to_string(),
                                name: repository.key().to_string(),
                            });
                        }
                        set.repositories.push(ResourceWithPath {
                            resource: repository,
                            path: path.to_path_buf(),
                        });
                    }
                    ManifestDocument::Secret(secret) => {
                        let key = NamespacedName::new(&secret.namespace, &secret.name);
                        if !seen_secrets.insert(key.clone()) {
                            return Err(ManifestError::DuplicateName {
                                kind: SECRET_KIND.to_string(),
                                name: key.to_string(),
                            });
                        }
                        set.secrets.push(ResourceWithPath {
                            resource: secret,
                            path: path.to_path_buf(),
                        });
                    }
                }
            }
        }

        log::debug!(
            "Loaded {} repositories and {} secrets from {}",
            set.repositories.len(),
            set.secrets.len(),
            self.manifest_dir.display()
        );
        Ok(set)
    }

    /// Loads every document of one file. Empty documents are skipped.
    pub fn load_file(&self, path: &Path) -> Result<Vec<ManifestDocument>> {
        let content = fs::read_to_string(path).map_err(|e| ManifestError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&content) {
            let value = serde_yaml::Value::deserialize(document).map_err(|e| {
                ManifestError::ParseYaml {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }
            })?;
            if value.is_null() {
                continue;
            }
            documents.push(parse_document(path, value)?);
        }
        Ok(documents)
    }
}

fn parse_document(path: &Path, value: serde_yaml::Value) -> Result<ManifestDocument> {
    let header: ResourceHeader =
        serde_yaml::from_value(value.clone()).map_err(|e| ManifestError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let invalid = |e: serde_yaml::Error| ManifestError::InvalidResource {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let check_version = |expected: &str| {
        if header.api_version == expected {
            Ok(())
        } else {
            Err(ManifestError::InvalidApiVersion {
                path: path.to_path_buf(),
                kind: header.kind.clone(),
                version: header.api_version.clone(),
                expected: expected.to_string(),
            })
        }
    };

    let document = match header.kind.as_str() {
        HELM_REPOSITORY_KIND => {
            check_version(API_VERSION)?;
            let repository: HelmRepository = serde_yaml::from_value(value).map_err(invalid)?;
            validate_name(path, &repository.metadata)?;
            ManifestDocument::HelmRepository(repository)
        }
        SECRET_KIND => {
            check_version(SECRET_API_VERSION)?;
            let manifest: SecretManifest = serde_yaml::from_value(value).map_err(invalid)?;
            validate_name(path, &manifest.metadata)?;
            ManifestDocument::Secret(manifest.into_secret()?)
        }
        other => {
            return Err(ManifestError::UnknownKind {
                path: path.to_path_buf(),
                kind: other.to_string(),
            })
        }
    };
    Ok(document)
}

fn validate_name(path: &Path, metadata: &ObjectMeta) -> Result<()> {
    let valid = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    };
    if !valid(&metadata.name) || !valid(&metadata.namespace) {
        return Err(ManifestError::InvalidResource {
            path: path.to_path_buf(),
            message: format!(
                "name '{}' and namespace '{}' must be non-empty lowercase alphanumerics, '-' or '.'",
                metadata.name, metadata.namespace
            ),
        });
    }
    Ok(())
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

pub(crate) fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
