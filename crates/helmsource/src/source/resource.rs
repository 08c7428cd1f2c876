//! K8s-style resource types for Helm repository sources.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The API version for all source resources.
pub const API_VERSION: &str = "source.helmsource.io/v1alpha1";

/// The kind of the managed resource.
pub const HELM_REPOSITORY_KIND: &str = "HelmRepository";

/// Finalizer placed on every managed resource so artifacts are removed
/// before the resource record disappears.
pub const SOURCE_FINALIZER: &str = "finalizers.source.helmsource.io";

/// The only condition type the engine maintains.
pub const READY_CONDITION: &str = "Ready";

/// The indexation of the repository succeeded.
pub const INDEXATION_SUCCEEDED_REASON: &str = "IndexationSucceed";

/// Fetching or storing the repository index failed.
pub const INDEXATION_FAILED_REASON: &str = "IndexationFailed";

/// Credentials could not be resolved or were rejected by the server.
pub const AUTHENTICATION_FAILED_REASON: &str = "AuthenticationFailed";

/// The fetched index was oversized or malformed.
pub const INDEX_VALIDATION_FAILED_REASON: &str = "IndexValidationFailed";

/// Namespace-qualified identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metadata for a resource, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// The unique name of the resource within its namespace.
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,

    /// Markers that defer removal of the record until cleared.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Incremented by the cluster on every spec change.
    #[serde(default)]
    pub generation: i64,

    /// Set when deletion was requested while finalizers remained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl ObjectMeta {
    /// Creates metadata with a namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.name)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Reference to a secret in the same namespace as the referencing resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Reconciliation period, written as a Go-style duration (`1m`, `30s`, `1h30m`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval(pub Duration);

impl Interval {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_duration(self.0))
    }
}

impl std::str::FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Interval)
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(self.0))
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw)
            .map(Interval)
            .map_err(serde::de::Error::custom)
    }
}

/// Parses a Go-style duration string made of `<integer><unit>` segments.
///
/// Supported units: `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("duration must not be empty".to_string());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(format!("invalid duration '{}': expected a number", input));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid duration '{}': {}", input, e))?;
        rest = &rest[digits..];

        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let segment = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "" => return Err(format!("invalid duration '{}': missing unit", input)),
            other => {
                return Err(format!(
                    "invalid duration '{}': unknown unit '{}'",
                    input, other
                ))
            }
        };
        total = segment
            .and_then(|segment| total.checked_add(segment))
            .ok_or_else(|| format!("invalid duration '{}': out of range", input))?;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

/// Formats a duration in the same notation `parse_duration` accepts.
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }

    let mut out = String::new();
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 {
        out.push_str(&format!("{}s", seconds));
    }
    let millis = duration.subsec_millis();
    if millis > 0 {
        out.push_str(&format!("{}ms", millis));
    }
    out
}

/// Desired state of a Helm repository source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositorySpec {
    /// The Helm repository URL; must contain at least a scheme and host.
    pub url: String,

    /// Secret holding `username`/`password` and/or `certFile`/`keyFile`/`caFile`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,

    /// How often to check the upstream for updates.
    pub interval: Interval,
}

/// Status of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A readiness observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Output of one successful repository sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Path relative to the storage root.
    pub path: String,

    /// Hex SHA-256 of the fetched index.
    pub revision: String,

    /// Hex SHA-256 of the stored file.
    #[serde(default)]
    pub checksum: String,

    /// Public download address.
    #[serde(default)]
    pub url: String,

    pub last_update_time: DateTime<Utc>,
}

/// Observed state of a Helm repository source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositoryStatus {
    /// The Ready condition. Serialized as a one-element `conditions` list.
    #[serde(
        default,
        rename = "conditions",
        with = "ready_condition",
        skip_serializing_if = "Option::is_none"
    )]
    pub ready: Option<Condition>,

    /// Download address of the last index fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    #[serde(default)]
    pub observed_generation: i64,
}

mod ready_condition {
    use super::{Condition, READY_CONDITION};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        condition: &Option<Condition>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        condition.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Condition>, D::Error> {
        let conditions = Vec::<Condition>::deserialize(deserializer)?;
        Ok(conditions
            .into_iter()
            .rev()
            .find(|c| c.condition_type == READY_CONDITION))
    }
}

impl HelmRepositoryStatus {
    /// Marks the source ready with the given artifact.
    ///
    /// An artifact at the same path as the current one is kept as-is so the
    /// original publish time survives a no-op pass.
    pub fn into_ready(
        mut self,
        artifact: Artifact,
        url: impl Into<String>,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        self.ready = Some(Condition {
            condition_type: READY_CONDITION.to_string(),
            status: ConditionStatus::True,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
        });
        self.url = Some(url.into());

        let same_path = self
            .artifact
            .as_ref()
            .is_some_and(|current| current.path == artifact.path);
        if !same_path {
            self.artifact = Some(artifact);
        }

        self
    }

    /// Marks the source not ready. The current artifact is left untouched.
    pub fn into_not_ready(mut self, reason: &str, message: impl Into<String>) -> Self {
        self.ready = Some(Condition {
            condition_type: READY_CONDITION.to_string(),
            status: ConditionStatus::False,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
        });
        self
    }

    pub fn is_ready(&self) -> bool {
        self.ready
            .as_ref()
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Message of the Ready condition when it is true.
    pub fn ready_message(&self) -> Option<&str> {
        self.ready
            .as_ref()
            .filter(|c| c.status == ConditionStatus::True)
            .map(|c| c.message.as_str())
    }

    pub fn reason(&self) -> Option<&str> {
        self.ready.as_ref().map(|c| c.reason.as_str())
    }
}

/// A Helm repository source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepository {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: HelmRepositorySpec,
    #[serde(default)]
    pub status: HelmRepositoryStatus,
}

impl HelmRepository {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: HelmRepositorySpec,
    ) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: HELM_REPOSITORY_KIND.to_string(),
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: HelmRepositoryStatus::default(),
        }
    }

    pub fn key(&self) -> NamespacedName {
        self.metadata.key()
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.status.artifact.as_ref()
    }

    pub fn interval(&self) -> Duration {
        self.spec.interval.as_duration()
    }
}
