//! HTTP(S) retrieval of a repository index.

use std::time::Duration;

use reqwest::{Certificate, Client, Identity, StatusCode, Url};
use secrecy::ExposeSecret;
use serde::Deserialize;
use thiserror::Error;

use super::credentials::{ResolvedCredentials, TlsFiles};
use super::resource::Interval;

/// File name of the index under the repository base URL.
pub const INDEX_FILE: &str = "index.yaml";

/// Default upper bound on the index size (50 MiB).
pub const DEFAULT_MAX_INDEX_SIZE: u64 = 50 * 1024 * 1024;

/// Default connect timeout for index requests.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum length for error bodies echoed into status messages.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Index fetch failures.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid repository URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("failed to read TLS material '{path}': {source}")]
    TlsMaterial {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("repository rejected the provided credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("failed to fetch index: HTTP {status}")]
    Status { status: u16 },

    #[error("failed to fetch index from {url}: {message}")]
    Network { url: String, message: String },

    #[error("fetching index from {url} timed out after {timeout}")]
    Timeout { url: String, timeout: Interval },

    #[error("index exceeds the maximum size of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("invalid index: {0}")]
    InvalidIndex(String),
}

impl FetchError {
    /// Returns true if the failure may clear up without a spec or secret change.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FetchError::InvalidUrl { .. } | FetchError::Client(_) | FetchError::TlsMaterial { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Fetcher limits.
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    /// Deadline for the whole request, body included.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_index_size: u64,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_index_size: DEFAULT_MAX_INDEX_SIZE,
        }
    }
}

/// A fetched, validated index payload.
#[derive(Debug, Clone)]
pub struct FetchedIndex {
    /// The address the index was downloaded from.
    pub url: String,
    pub payload: Vec<u8>,
}

/// Minimal view of an index document, enough to reject garbage.
#[derive(Debug, Deserialize)]
struct IndexHeader {
    #[serde(default, rename = "apiVersion")]
    api_version: String,
    #[serde(default)]
    entries: Option<serde_yaml::Mapping>,
}

/// Downloads repository indexes. Holds no connection state between fetches.
#[derive(Debug, Clone, Default)]
pub struct IndexFetcher {
    settings: FetcherSettings,
}

impl IndexFetcher {
    pub fn new(settings: FetcherSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FetcherSettings {
        &self.settings
    }

    /// GETs `<base_url>/index.yaml` with the given credentials.
    pub async fn fetch(
        &self,
        base_url: &str,
        credentials: &ResolvedCredentials,
    ) -> Result<FetchedIndex> {
        let url = index_url(base_url)?;
        let client = self.build_client(credentials.tls()).await?;

        let mut request = client.get(url.clone());
        if let Some(auth) = credentials.basic_auth() {
            request = request.basic_auth(&auth.username, Some(auth.password.expose_secret()));
        }

        log::debug!("Fetching index from {}", url);
        let mut response = request
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = error_body(&mut response).await;
            log::debug!("Index request to {} failed ({}): {}", url, status, body);
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let limit = self.settings.max_index_size;
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(FetchError::TooLarge { limit });
        }

        let mut payload = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.transport_error(&url, e))?
        {
            if (payload.len() + chunk.len()) as u64 > limit {
                return Err(FetchError::TooLarge { limit });
            }
            payload.extend_from_slice(&chunk);
        }

        validate_index(&payload)?;

        Ok(FetchedIndex {
            url: url.to_string(),
            payload,
        })
    }

    async fn build_client(&self, tls: Option<&TlsFiles>) -> Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .timeout(self.settings.timeout);

        if let Some(tls) = tls {
            let cert = read_material(&tls.cert_file).await?;
            let key = read_material(&tls.key_file).await?;
            let ca = read_material(&tls.ca_file).await?;

            let identity = Identity::from_pem(&[cert, key].concat())
                .map_err(|e| FetchError::Client(format!("invalid client certificate: {}", e)))?;
            let ca = Certificate::from_pem(&ca)
                .map_err(|e| FetchError::Client(format!("invalid CA certificate: {}", e)))?;
            builder = builder.identity(identity).add_root_certificate(ca);
        }

        builder
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))
    }

    fn transport_error(&self, url: &Url, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout: Interval(self.settings.timeout),
            }
        } else {
            FetchError::Network {
                url: url.to_string(),
                message: error_chain(&err),
            }
        }
    }
}

/// Reads the head of an error response, leaving the rest of the body unread.
async fn error_body(response: &mut reqwest::Response) -> String {
    let mut body = Vec::new();
    while body.len() <= MAX_ERROR_BODY_LENGTH {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }
    truncate(&String::from_utf8_lossy(&body))
}

/// Builds the index address from a repository base URL.
///
/// `https://charts.example.com/stable` and `https://charts.example.com/stable/`
/// both resolve to `https://charts.example.com/stable/index.yaml`.
pub fn index_url(base_url: &str) -> Result<Url> {
    let invalid = |reason: &str| FetchError::InvalidUrl {
        url: base_url.to_string(),
        reason: reason.to_string(),
    };

    let mut url = Url::parse(base_url.trim()).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid("only http and https are supported"));
    }
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(invalid("URL must contain a host"));
    }

    let path = format!("{}/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    url.join(INDEX_FILE).map_err(|e| invalid(&e.to_string()))
}

/// Rejects payloads that are not a repository index.
pub fn validate_index(payload: &[u8]) -> Result<()> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(FetchError::InvalidIndex("index is empty".to_string()));
    }

    let header: IndexHeader = serde_yaml::from_slice(payload)
        .map_err(|e| FetchError::InvalidIndex(e.to_string()))?;
    if header.api_version.trim().is_empty() {
        return Err(FetchError::InvalidIndex(
            "missing apiVersion".to_string(),
        ));
    }

    log::trace!(
        "Index {} lists {} charts",
        header.api_version,
        header.entries.map(|e| e.len()).unwrap_or(0)
    );
    Ok(())
}

async fn read_material(path: &std::path::Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| FetchError::TlsMaterial {
            path: path.display().to_string(),
            source: e,
        })
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn truncate(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}
