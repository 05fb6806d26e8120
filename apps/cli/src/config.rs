//! CLI configuration loading and merging.

use std::path::{Path, PathBuf};
use tibok_core::PluginConfig;

/// Command-line values that take precedence over the configuration file.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub plugins_dir: Option<PathBuf>,
    pub registry_url: Option<String>,
}

/// Load and merge plugin configuration.
///
/// Configuration precedence:
/// 1. CLI arguments
/// 2. Environment variables (`TIBOK_*`)
/// 3. The file named by `--config`, or `~/.tibok/plugins.toml`
/// 4. Defaults
pub fn load_config(overrides: &ConfigOverrides) -> anyhow::Result<PluginConfig> {
    let mut config = match &overrides.config_file {
        Some(path) => {
            let mut config = PluginConfig::load_from_file(path)?;
            config.apply_env_overrides();
            config
        }
        None => PluginConfig::discover_and_load()?,
    };

    if let Some(dir) = &overrides.plugins_dir {
        config.plugins_dir.clone_from(dir);
        // Keep lifecycle state next to an explicitly chosen plugins directory.
        config.state_file = sibling(dir, "plugin-state.json");
    }
    if let Some(url) = &overrides.registry_url {
        config.registry_url.clone_from(url);
    }

    config.validate()?;
    Ok(config)
}

fn sibling(dir: &Path, name: &str) -> PathBuf {
    dir.parent().map_or_else(|| PathBuf::from(name), |parent| parent.join(name))
}
