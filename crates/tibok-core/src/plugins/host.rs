//! Composition root for the plugin subsystem.
//!
//! [`PluginSystem`] builds every service once from a [`PluginConfig`] and
//! hands out shared handles. Hosts keep the returned [`ApprovalInbox`] and
//! answer the approval requests it yields.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::approval::{ApprovalInbox, approval_channel};
use super::contributions::{ContributionKind, ContributionRegistry};
use super::discovery::{DiscoveryOptions, DiscoveryReport, DiscoveryService, SearchLocation};
use super::downloader::{Downloader, DownloaderOptions, HttpFetcher, PackageFetcher};
use super::error::{PluginError, Result};
use super::installer::Installer;
use super::lifecycle::{JsonFileStore, LifecycleManager, LifecycleStore};
use super::registry::{CatalogSource, FileCatalogSource, HttpCatalogSource, RegistryClient};
use super::signing::{PackageSigner, TrustedKeys};
use crate::config::PluginConfig;

const APPROVAL_BUFFER: usize = 8;

/// Optional replacements for the default backends.
#[derive(Default)]
pub struct PluginSystemBuilder {
    catalog_source: Option<Arc<dyn CatalogSource>>,
    fetcher: Option<Arc<dyn PackageFetcher>>,
    store: Option<Arc<dyn LifecycleStore>>,
    trusted_keys: Option<TrustedKeys>,
}

impl PluginSystemBuilder {
    /// Replaces the catalog source built from `registry_url`.
    pub fn catalog_source(mut self, source: Arc<dyn CatalogSource>) -> Self {
        self.catalog_source = Some(source);
        self
    }

    /// Replaces the HTTP package fetcher.
    pub fn fetcher(mut self, fetcher: Arc<dyn PackageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replaces the JSON file lifecycle store.
    pub fn store(mut self, store: Arc<dyn LifecycleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses these keys instead of reading `trusted_keys_dir`.
    pub fn trusted_keys(mut self, keys: TrustedKeys) -> Self {
        self.trusted_keys = Some(keys);
        self
    }

    /// Builds the services. Backends not supplied come from `config`.
    pub fn build(self, config: PluginConfig) -> Result<(PluginSystem, ApprovalInbox)> {
        let trusted_keys = match self.trusted_keys {
            Some(keys) => keys,
            None => TrustedKeys::from_directory(&config.trusted_keys_dir).map_err(|e| {
                PluginError::Io(std::io::Error::other(format!(
                    "loading trusted keys from {}: {}",
                    config.trusted_keys_dir.display(),
                    e
                )))
            })?,
        };
        let trusted_keys = Arc::new(trusted_keys);

        let catalog_source = match self.catalog_source {
            Some(source) => source,
            None => default_catalog_source(&config)?,
        };
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(config.request_timeout())?) as Arc<dyn PackageFetcher>,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(JsonFileStore::new(&config.state_file)) as Arc<dyn LifecycleStore>);

        let mut locations = Vec::new();
        if let Some(builtin) = &config.builtin_dir {
            locations.push(SearchLocation::builtin(builtin));
        }
        locations.push(SearchLocation::user(&config.plugins_dir));

        let install_key_file = config.install_key_file();
        let install_key = PackageSigner::load_or_generate(&install_key_file).map_err(|e| {
            PluginError::Io(std::io::Error::other(format!(
                "install key {}: {}",
                install_key_file.display(),
                e
            )))
        })?;
        let receipt_keys = install_key.trusted_keys("host");

        let discovery = Arc::new(DiscoveryService::new(
            DiscoveryOptions { locations, host_version: config.host_version.clone(), receipt_keys },
            Arc::clone(&trusted_keys),
        ));
        let registry = Arc::new(RegistryClient::new(catalog_source).with_ttl(config.cache_ttl()));
        let downloader = Arc::new(Downloader::new(
            DownloaderOptions {
                plugins_dir: config.plugins_dir.clone(),
                max_concurrent: config.max_concurrent_downloads,
            },
            fetcher,
            Arc::clone(&trusted_keys),
            Arc::new(install_key),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(store));

        let commands = Arc::new(ContributionRegistry::new(ContributionKind::Commands));
        let slash_commands = Arc::new(ContributionRegistry::new(ContributionKind::SlashCommands));
        lifecycle.add_observer(commands.clone());
        lifecycle.add_observer(slash_commands.clone());

        let (gate, inbox) = approval_channel(APPROVAL_BUFFER);
        let installer = Arc::new(Installer::new(
            Arc::clone(&registry),
            Arc::clone(&downloader),
            Arc::clone(&discovery),
            Arc::clone(&lifecycle),
            gate,
        ));

        debug!(
            plugins_dir = %config.plugins_dir.display(),
            registry = %config.registry_url,
            trusted_keys = trusted_keys.names().len(),
            "Plugin system constructed"
        );

        let system = PluginSystem {
            config,
            trusted_keys,
            registry,
            downloader,
            discovery,
            lifecycle,
            installer,
            commands,
            slash_commands,
        };
        Ok((system, inbox))
    }
}

fn default_catalog_source(config: &PluginConfig) -> Result<Arc<dyn CatalogSource>> {
    let url = config.registry_url.as_str();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Arc::new(HttpCatalogSource::new(url, config.request_timeout())?))
    } else {
        Ok(Arc::new(FileCatalogSource::from_url(url)))
    }
}

/// Every plugin service, built once.
pub struct PluginSystem {
    config: PluginConfig,
    trusted_keys: Arc<TrustedKeys>,
    registry: Arc<RegistryClient>,
    downloader: Arc<Downloader>,
    discovery: Arc<DiscoveryService>,
    lifecycle: Arc<LifecycleManager>,
    installer: Arc<Installer>,
    commands: Arc<ContributionRegistry>,
    slash_commands: Arc<ContributionRegistry>,
}

impl PluginSystem {
    /// Builds the system with HTTP and file backends from `config`.
    pub fn new(config: PluginConfig) -> Result<(Self, ApprovalInbox)> {
        PluginSystemBuilder::default().build(config)
    }

    /// Builder for custom backends.
    pub fn builder() -> PluginSystemBuilder {
        PluginSystemBuilder::default()
    }

    /// Purges stale staging data, discovers plugins and restores lifecycle state.
    pub async fn start(&self) -> Result<DiscoveryReport> {
        if let Err(e) = self.downloader.purge_staging().await {
            warn!(error = %e, "Could not purge plugin staging directory");
        }
        let report = self.discovery.discover().await?;
        self.lifecycle.sync_discovered(&report.plugins);
        info!(
            plugins = report.plugins.len(),
            enabled = self.lifecycle.records().iter().filter(|r| r.is_enabled()).count(),
            "Plugin system started"
        );
        Ok(report)
    }

    /// Configuration the system was built from.
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn trusted_keys(&self) -> &Arc<TrustedKeys> {
        &self.trusted_keys
    }

    /// Catalog client.
    pub fn registry(&self) -> &Arc<RegistryClient> {
        &self.registry
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    /// Lifecycle manager. Observers registered here see every transition.
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Installer for install, update, uninstall and enable flows.
    pub fn installer(&self) -> &Arc<Installer> {
        &self.installer
    }

    /// Commands contributed by enabled plugins.
    pub fn commands(&self) -> &Arc<ContributionRegistry> {
        &self.commands
    }

    /// Slash commands contributed by enabled plugins.
    pub fn slash_commands(&self) -> &Arc<ContributionRegistry> {
        &self.slash_commands
    }
}
