//! Turns a repository secret into transport options for the index fetcher.

use std::io::Write;
use std::path::{Path, PathBuf};

use secrecy::SecretString;

use crate::secrets::Secret;

pub const USERNAME_FIELD: &str = "username";
pub const PASSWORD_FIELD: &str = "password";
pub const CERT_FILE_FIELD: &str = "certFile";
pub const KEY_FILE_FIELD: &str = "keyFile";
pub const CA_FILE_FIELD: &str = "caFile";

const TLS_FIELDS: [&str; 3] = [CERT_FILE_FIELD, KEY_FILE_FIELD, CA_FILE_FIELD];

/// Errors raised while turning a secret into transport options.
///
/// All of these are configuration problems: retrying without a secret or spec
/// change yields the same result.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid '{secret}' secret data: required fields {}", .fields.join(", "))]
    MissingFields {
        secret: String,
        fields: Vec<&'static str>,
    },

    #[error("secret '{0}' not found")]
    SecretNotFound(String),

    #[error("failed to write credential file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CredentialError>;

/// HTTP basic authentication pair.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: SecretString,
}

/// Paths of materialized TLS client material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
}

/// A single option applied to the HTTP client.
#[derive(Debug, Clone)]
pub enum TransportOption {
    BasicAuth(BasicAuth),
    Tls(TlsFiles),
}

/// RAII guard for ephemeral credential files.
///
/// Deletes every tracked file when dropped, so key material never outlives
/// the fetch that needed it, whichever way that fetch returns.
#[derive(Debug, Default)]
pub struct CredentialFiles {
    paths: Vec<PathBuf>,
}

impl CredentialFiles {
    /// Creates an empty guard that does nothing on drop.
    pub fn empty() -> Self {
        Self { paths: Vec::new() }
    }

    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// Moves the files tracked by `other` into this guard.
    fn absorb(&mut self, mut other: CredentialFiles) {
        self.paths.append(&mut other.paths);
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for CredentialFiles {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!(
                        "Failed to clean up credential file {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
    }
}

/// Transport options resolved from a secret.
///
/// `_cleanup` must outlive the HTTP client built from `options`.
#[derive(Debug, Default)]
pub struct ResolvedCredentials {
    pub options: Vec<TransportOption>,
    pub _cleanup: CredentialFiles,
}

impl ResolvedCredentials {
    /// Anonymous access.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn basic_auth(&self) -> Option<&BasicAuth> {
        self.options.iter().find_map(|o| match o {
            TransportOption::BasicAuth(auth) => Some(auth),
            TransportOption::Tls(_) => None,
        })
    }

    pub fn tls(&self) -> Option<&TlsFiles> {
        self.options.iter().find_map(|o| match o {
            TransportOption::Tls(tls) => Some(tls),
            TransportOption::BasicAuth(_) => None,
        })
    }
}

/// Reads basic auth from the secret.
///
/// Both fields absent is not an error; one without the other is.
pub fn basic_auth_from_secret(secret: &Secret) -> Result<Option<BasicAuth>> {
    let username = secret.non_empty(USERNAME_FIELD);
    let password = secret.non_empty(PASSWORD_FIELD);

    match (username, password) {
        (None, None) => Ok(None),
        (Some(username), Some(password)) => Ok(Some(BasicAuth {
            username: String::from_utf8_lossy(username).into_owned(),
            password: SecretString::from(String::from_utf8_lossy(password).into_owned()),
        })),
        (Some(_), None) => Err(missing(secret, vec![PASSWORD_FIELD])),
        (None, Some(_)) => Err(missing(secret, vec![USERNAME_FIELD])),
    }
}

/// Materializes TLS client material from the secret into `dir`.
///
/// Requires all of `certFile`, `keyFile` and `caFile`; none present yields
/// `None`. The returned guard owns the written files.
pub fn tls_from_secret(secret: &Secret, dir: &Path) -> Result<Option<(TlsFiles, CredentialFiles)>> {
    let present: Vec<&str> = TLS_FIELDS
        .iter()
        .copied()
        .filter(|f| secret.non_empty(f).is_some())
        .collect();
    if present.is_empty() {
        return Ok(None);
    }
    if present.len() != TLS_FIELDS.len() {
        let absent = TLS_FIELDS
            .iter()
            .copied()
            .filter(|f| !present.contains(f))
            .collect();
        return Err(missing(secret, absent));
    }

    let mut cleanup = CredentialFiles::empty();
    let prefix = format!("helmsource-{}", uuid::Uuid::new_v4());
    let mut write = |field: &str, suffix: &str| -> Result<PathBuf> {
        let path = dir.join(format!("{}-{}", prefix, suffix));
        write_private_file(&path, secret.non_empty(field).unwrap_or_default())?;
        cleanup.track(path.clone());
        Ok(path)
    };

    // On error, `cleanup` drops here and removes what was already written.
    let cert_file = write(CERT_FILE_FIELD, "cert.pem")?;
    let key_file = write(KEY_FILE_FIELD, "key.pem")?;
    let ca_file = write(CA_FILE_FIELD, "ca.pem")?;

    Ok(Some((
        TlsFiles {
            cert_file,
            key_file,
            ca_file,
        },
        cleanup,
    )))
}

/// Resolves every supported option from the secret, writing TLS material to
/// the system temp directory.
pub fn client_options_from_secret(secret: &Secret) -> Result<ResolvedCredentials> {
    client_options_from_secret_in(secret, &std::env::temp_dir())
}

/// Resolves every supported option from the secret, writing TLS material to `dir`.
///
/// Fails as a whole when either credential kind is invalid.
pub fn client_options_from_secret_in(secret: &Secret, dir: &Path) -> Result<ResolvedCredentials> {
    let mut resolved = ResolvedCredentials::none();

    if let Some(auth) = basic_auth_from_secret(secret)? {
        resolved.options.push(TransportOption::BasicAuth(auth));
    }

    if let Some((tls, files)) = tls_from_secret(secret, dir)? {
        resolved.options.push(TransportOption::Tls(tls));
        resolved._cleanup.absorb(files);
    }

    Ok(resolved)
}

fn missing(secret: &Secret, fields: Vec<&'static str>) -> CredentialError {
    CredentialError::MissingFields {
        secret: format!("{}/{}", secret.namespace, secret.name),
        fields,
    }
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let map_err = |e| CredentialError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    };

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(map_err)?;
    file.write_all(contents).map_err(map_err)?;
    file.sync_all().map_err(map_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    fn basic_auth_fixture() -> Secret {
        Secret::new("default", "auth")
            .with_field(USERNAME_FIELD, "user")
            .with_field(PASSWORD_FIELD, "password")
    }

    fn tls_fixture() -> Secret {
        Secret::new("default", "tls")
            .with_field(CERT_FILE_FIELD, "cert-fixture")
            .with_field(KEY_FILE_FIELD, "key-fixture")
            .with_field(CA_FILE_FIELD, "ca-fixture")
    }

    fn merged(secrets: &[Secret]) -> Secret {
        let mut out = Secret::new("default", "merged");
        for s in secrets {
            out.data.extend(s.data.clone());
        }
        out
    }

    #[test]
    fn test_client_options_counts() {
        let dir = TempDir::new().unwrap();
        let cases: Vec<(&str, Vec<Secret>)> = vec![
            ("basic auth", vec![basic_auth_fixture()]),
            ("TLS", vec![tls_fixture()]),
            ("basic auth and TLS", vec![basic_auth_fixture(), tls_fixture()]),
            ("empty", vec![]),
        ];

        for (name, secrets) in cases {
            let resolved = client_options_from_secret_in(&merged(&secrets), dir.path())
                .unwrap_or_else(|e| panic!("{}: {}", name, e));
            assert_eq!(resolved.options.len(), secrets.len(), "{}", name);
        }
    }

    #[test]
    fn test_basic_auth_from_secret() {
        let auth = basic_auth_from_secret(&basic_auth_fixture()).unwrap().unwrap();
        assert_eq!(auth.username, "user");
        assert_eq!(auth.password.expose_secret(), "password");

        assert!(basic_auth_from_secret(&Secret::default()).unwrap().is_none());
    }

    #[test]
    fn test_basic_auth_missing_password_names_field() {
        let mut secret = basic_auth_fixture();
        secret.data.remove(PASSWORD_FIELD);
        let err = basic_auth_from_secret(&secret).unwrap_err();
        match &err {
            CredentialError::MissingFields { fields, .. } => {
                assert_eq!(fields, &vec![PASSWORD_FIELD])
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_basic_auth_missing_username_names_field() {
        let mut secret = basic_auth_fixture();
        secret.data.remove(USERNAME_FIELD);
        let err = basic_auth_from_secret(&secret).unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn test_basic_auth_empty_password_is_missing() {
        let secret = basic_auth_fixture().with_field(PASSWORD_FIELD, "");
        assert!(basic_auth_from_secret(&secret).is_err());
    }

    #[test]
    fn test_tls_missing_fields() {
        let dir = TempDir::new().unwrap();
        for field in TLS_FIELDS {
            let mut secret = tls_fixture();
            secret.data.remove(field);
            let err = tls_from_secret(&secret, dir.path()).unwrap_err();
            assert!(err.to_string().contains(field), "{}", err);
        }

        let partial = Secret::new("default", "tls").with_field(CA_FILE_FIELD, "ca");
        match tls_from_secret(&partial, dir.path()).unwrap_err() {
            CredentialError::MissingFields { fields, .. } => {
                assert_eq!(fields, vec![CERT_FILE_FIELD, KEY_FILE_FIELD])
            }
            other => panic!("unexpected error: {}", other),
        }

        // Nothing may be left behind on failure.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_tls_files_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let resolved = client_options_from_secret_in(&tls_fixture(), dir.path()).unwrap();
        let tls = resolved.tls().unwrap().clone();

        assert_eq!(std::fs::read(&tls.cert_file).unwrap(), b"cert-fixture");
        assert_eq!(std::fs::read(&tls.key_file).unwrap(), b"key-fixture");
        assert_eq!(std::fs::read(&tls.ca_file).unwrap(), b"ca-fixture");
        assert_eq!(resolved._cleanup.paths().len(), 3);

        drop(resolved);
        assert!(!tls.cert_file.exists());
        assert!(!tls.key_file.exists());
        assert!(!tls.ca_file.exists());
    }

    #[test]
    fn test_invalid_basic_auth_fails_whole_resolution() {
        let dir = TempDir::new().unwrap();
        let mut secret = merged(&[basic_auth_fixture(), tls_fixture()]);
        secret.data.remove(PASSWORD_FIELD);
        assert!(client_options_from_secret_in(&secret, dir.path()).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_tls_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let resolved = client_options_from_secret_in(&tls_fixture(), dir.path()).unwrap();
        let key = &resolved.tls().unwrap().key_file;
        let mode = std::fs::metadata(key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
