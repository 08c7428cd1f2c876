use std::path::{Path, PathBuf};

use crate::config::schema::ControllerConfig;
use crate::error::ConfigError;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "HELMSOURCE_CONFIG";

/// Config document syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// `.json` files are JSON; everything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ControllerConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content, ConfigFormat::from_path(path))
}

pub fn load_config_from_str(
    content: &str,
    format: ConfigFormat,
) -> Result<ControllerConfig, ConfigError> {
    let config: ControllerConfig = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
        ConfigFormat::Json => serde_json::from_str(content)?,
    };

    validate_config(&config)?;

    Ok(config)
}

/// Picks the config file: explicit argument, then `HELMSOURCE_CONFIG`, then
/// `<config dir>/helmsource/config.yaml`.
pub fn resolve_config_path(explicit: Option<&str>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit.filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path().ok_or(ConfigError::NoConfigPath)
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("helmsource").join("config.yaml"))
}

fn validate_config(config: &ControllerConfig) -> Result<(), ConfigError> {
    let invalid = |message: &str| {
        Err(ConfigError::Validation {
            message: message.to_string(),
        })
    };

    if config.storage.path.trim().is_empty() {
        return invalid("storage.path must not be empty");
    }

    let hostname = config.storage.hostname.trim();
    if hostname.is_empty() {
        return invalid("storage.hostname must not be empty");
    }
    if hostname.contains("://") || hostname.contains('/') {
        return invalid("storage.hostname must be a host[:port] without scheme or path");
    }

    if config.storage.timeout.as_duration().is_zero() {
        return invalid("storage.timeout must be greater than zero");
    }
    if config.reconciler.retry_interval.as_duration().is_zero() {
        return invalid("reconciler.retryInterval must be greater than zero");
    }
    if config.reconciler.fetch_timeout.as_duration().is_zero() {
        return invalid("reconciler.fetchTimeout must be greater than zero");
    }
    if config.reconciler.max_index_size == 0 {
        return invalid("reconciler.maxIndexSize must be greater than zero");
    }
    if config.reconciler.concurrency == 0 {
        return invalid("reconciler.concurrency must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_yaml() {
        let yaml = r#"
storage:
  path: /var/lib/helmsource
  hostname: source-controller.local
"#;
        let config = load_config_from_str(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.storage.path, "/var/lib/helmsource");
        assert_eq!(config.storage.timeout.as_duration(), Duration::from_secs(30));
        assert_eq!(
            config.reconciler.retry_interval.as_duration(),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.reconciler.fetch_timeout.as_duration(),
            Duration::from_secs(60)
        );
        assert_eq!(config.reconciler.max_index_size, 50 * 1024 * 1024);
        assert_eq!(config.reconciler.concurrency, 4);
        assert!(config.reconciler.resync_interval.is_none());
        assert!(config.manifests.directory.is_none());
        assert!(config.manifests.watch);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_full_yaml() {
        let yaml = r#"
storage:
  path: /data
  hostname: localhost:9090
  timeout: 1m
reconciler:
  retryInterval: 5s
  fetchTimeout: 2m
  maxIndexSize: 1024
  concurrency: 8
  resyncInterval: 1h
manifests:
  directory: /etc/helmsource/manifests
  watch: false
logging:
  level: debug
  json: true
"#;
        let config = load_config_from_str(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.scheduler_settings().concurrency, 8);
        assert_eq!(
            config.scheduler_settings().resync_interval,
            Some(Duration::from_secs(3600))
        );
        assert_eq!(config.fetcher_settings().timeout, Duration::from_secs(120));
        assert_eq!(config.fetcher_settings().max_index_size, 1024);
        assert_eq!(
            config.reconciler_settings().retry_interval,
            Duration::from_secs(5)
        );
        assert_eq!(
            config.manifest_directory(),
            Some(PathBuf::from("/etc/helmsource/manifests"))
        );
        assert!(!config.manifests.watch);
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_json() {
        let json = r#"{
            "storage": { "path": "/data", "hostname": "localhost" },
            "reconciler": { "retryInterval": "30s" }
        }"#;
        let config = load_config_from_str(json, ConfigFormat::Json).unwrap();
        assert_eq!(
            config.reconciler.retry_interval.as_duration(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            ("storage:\n  path: ''\n  hostname: h\n", "storage.path"),
            ("storage:\n  path: /d\n  hostname: ''\n", "storage.hostname"),
            (
                "storage:\n  path: /d\n  hostname: http://h\n",
                "storage.hostname",
            ),
            (
                "storage:\n  path: /d\n  hostname: h\n  timeout: '0'\n",
                "storage.timeout",
            ),
            (
                "storage:\n  path: /d\n  hostname: h\nreconciler:\n  retryInterval: '0'\n",
                "retryInterval",
            ),
            (
                "storage:\n  path: /d\n  hostname: h\nreconciler:\n  concurrency: 0\n",
                "concurrency",
            ),
        ];

        for (yaml, field) in cases {
            let err = load_config_from_str(yaml, ConfigFormat::Yaml).unwrap_err();
            assert!(err.to_string().contains(field), "{}: {}", field, err);
        }
    }

    #[test]
    fn test_unparseable_duration() {
        let yaml = "storage:\n  path: /d\n  hostname: h\n  timeout: soon\n";
        assert!(matches!(
            load_config_from_str(yaml, ConfigFormat::Yaml),
            Err(ConfigError::ParseYaml(_))
        ));

        let yaml = "storage:\n  path: /d\n  hostname: h\n  timeout: 10000000000000000h\n";
        assert!(matches!(
            load_config_from_str(yaml, ConfigFormat::Yaml),
            Err(ConfigError::ParseYaml(_))
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"storage": {"path": "/data", "hostname": "localhost"}}"#,
        )
        .unwrap();
        assert_eq!(ConfigFormat::from_path(&path), ConfigFormat::Json);
        assert_eq!(load_config(&path).unwrap().storage.hostname, "localhost");

        let missing = load_config(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::ReadFile { .. }));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path() {
        std::env::set_var(CONFIG_ENV_VAR, "/from/env.yaml");
        assert_eq!(
            resolve_config_path(Some("/from/arg.yaml")).unwrap(),
            PathBuf::from("/from/arg.yaml")
        );
        assert_eq!(
            resolve_config_path(None).unwrap(),
            PathBuf::from("/from/env.yaml")
        );

        std::env::remove_var(CONFIG_ENV_VAR);
        if let Some(default) = default_config_path() {
            assert_eq!(resolve_config_path(None).unwrap(), default);
            assert!(default.ends_with("helmsource/config.yaml"));
        }
    }
}
