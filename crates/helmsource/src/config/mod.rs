pub mod loader;
pub mod schema;

pub use loader::{
    default_config_path, load_config, load_config_from_str, resolve_config_path, ConfigFormat,
    CONFIG_ENV_VAR,
};
pub use schema::{
    ControllerConfig, LoggingConfig, ManifestsConfig, ReconcilerConfig, StorageConfig,
};
