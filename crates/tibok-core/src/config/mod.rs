//! Plugin subsystem configuration.
//!
//! Loaded from `~/.tibok/plugins.toml` when present, then overridden by
//! `TIBOK_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::plugins::versioning::is_valid_version;

/// Default catalog endpoint.
pub const DEFAULT_REGISTRY_URL: &str = "https://plugins.tibok.app/v1/catalog.json";

/// Plugin subsystem configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Directory plugins are installed into and sideloaded from.
    pub plugins_dir: PathBuf,

    /// Plugins bundled with the host.
    pub builtin_dir: Option<PathBuf>,

    /// Persisted lifecycle state.
    pub state_file: PathBuf,

    /// Directory of `*.pub` keys trusted for signatures.
    pub trusted_keys_dir: PathBuf,

    /// Catalog endpoint. Anything but an `http(s)` URL is read as a local file.
    pub registry_url: String,

    /// Catalog cache lifetime. Absent means the cache never expires on its own.
    pub cache_ttl_secs: Option<u64>,

    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,

    /// Upper bound on downloads running at once.
    pub max_concurrent_downloads: usize,

    /// Host version compared against `minHostVersion`.
    pub host_version: String,
}

fn tibok_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".tibok")
}

impl Default for PluginConfig {
    fn default() -> Self {
        let home = tibok_home();
        Self {
            plugins_dir: home.join("plugins"),
            builtin_dir: None,
            state_file: home.join("plugin-state.json"),
            trusted_keys_dir: home.join("trusted-keys"),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            cache_ttl_secs: None,
            request_timeout_secs: 30,
            max_concurrent_downloads: 4,
            host_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl PluginConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::ReadError(format!("Failed to create directory: {}", e)))?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::ReadError(format!("Failed to write file: {}", e)))
    }

    /// Get default configuration file path.
    pub fn default_path() -> PathBuf {
        tibok_home().join("plugins.toml")
    }

    /// Loads the default file if present, then applies environment overrides.
    ///
    /// A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn discover_and_load() -> ConfigResult<Self> {
        let mut config = match Self::load_from_file(&Self::default_path()) {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => Self::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies `TIBOK_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("TIBOK_PLUGINS_DIR") {
            self.plugins_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("TIBOK_BUILTIN_PLUGINS_DIR") {
            self.builtin_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = get("TIBOK_REGISTRY_URL") {
            self.registry_url = url;
        }
        if let Some(version) = get("TIBOK_HOST_VERSION") {
            self.host_version = version;
        }
    }

    /// Rejects values the plugin system cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(ConfigError::InvalidValue("max_concurrent_downloads must be at least 1".to_string()));
        }
        if !is_valid_version(&self.host_version) {
            return Err(ConfigError::InvalidValue(format!("host_version '{}' is not a version", self.host_version)));
        }
        if self.registry_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue("registry_url is empty".to_string()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Host install key, kept next to the lifecycle state.
    pub fn install_key_file(&self) -> PathBuf {
        self.state_file.with_file_name("install.key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PluginConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.plugins_dir.ends_with(".tibok/plugins"));
        assert_eq!(config.registry_url, DEFAULT_REGISTRY_URL);
        assert_eq!(config.max_concurrent_downloads, 4);
        assert!(config.cache_ttl().is_none());
        assert!(config.install_key_file().ends_with(".tibok/install.key"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("plugins.toml");
        std::fs::write(&path, "plugins_dir = \"/opt/tibok/plugins\"\ncache_ttl_secs = 600\n").unwrap();

        let config = PluginConfig::load_from_file(&path).unwrap();
        assert_eq!(config.plugins_dir, PathBuf::from("/opt/tibok/plugins"));
        assert_eq!(config.cache_ttl(), Some(Duration::from_secs(600)));
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_load_errors() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.toml");
        assert!(matches!(PluginConfig::load_from_file(&missing), Err(ConfigError::NotFound(_))));

        let bad = temp_dir.path().join("bad.toml");
        std::fs::write(&bad, "max_concurrent_downloads = \"many\"").unwrap();
        assert!(matches!(PluginConfig::load_from_file(&bad), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("plugins.toml");
        let config = PluginConfig { builtin_dir: Some(PathBuf::from("/usr/share/tibok")), ..Default::default() };

        config.save_to_file(&path).unwrap();
        assert_eq!(PluginConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TIBOK_PLUGINS_DIR", "/tmp/plugins"),
            ("TIBOK_REGISTRY_URL", "http://localhost:9000/catalog.json"),
            ("TIBOK_HOST_VERSION", "2.1.0"),
            ("TIBOK_BUILTIN_PLUGINS_DIR", ""),
        ]);
        let mut config = PluginConfig::default();
        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.plugins_dir, PathBuf::from("/tmp/plugins"));
        assert_eq!(config.registry_url, "http://localhost:9000/catalog.json");
        assert_eq!(config.host_version, "2.1.0");
        assert!(config.builtin_dir.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = PluginConfig { max_concurrent_downloads: 0, ..Default::default() };
        assert!(matches!(zero.validate(), Err(ConfigError::InvalidValue(_))));

        let version = PluginConfig { host_version: "dev".to_string(), ..Default::default() };
        assert!(version.validate().is_err());

        let url = PluginConfig { registry_url: " ".to_string(), ..Default::default() };
        assert!(url.validate().is_err());
    }
}
