//! Install, update and uninstall orchestration.
//!
//! The installer validates a catalog entry, gates it on capability approval,
//! drives the downloader and finally registers the plugin with discovery and
//! the lifecycle manager. A failure at any step leaves no lifecycle record
//! and no registered manifest behind.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::approval::{ApprovalDecision, ApprovalGate};
use super::capability::{ManifestOrigin, TrustAssessment};
use super::discovery::{DiscoveredPlugin, DiscoveryService};
use super::downloader::Downloader;
use super::error::{PluginError, Result};
use super::lifecycle::{LifecycleManager, LifecycleRecord};
use super::manifest::PluginManifest;
use super::registry::{CatalogEntry, RegistryClient, has_update};
use super::versioning::satisfies_minimum;

/// Result of [`Installer::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The catalog has nothing newer.
    UpToDate { version: String },
    Updated { from: String, to: String },
}

/// An installed plugin with a newer catalog version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedPlugin {
    /// Plugin identifier.
    pub id: String,
    /// Installed version.
    pub installed: String,
    /// Newer version offered by the catalog.
    pub available: String,
}

/// Marks an identifier as busy for the duration of an operation.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Result<Self> {
        let mut busy = set.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(id.to_string()) {
            return Err(PluginError::DuplicateIdentifier(id.to_string()));
        }
        Ok(Self { set, id: id.to_string() })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
    }
}

/// Plugin installer.
pub struct Installer {
    registry: Arc<RegistryClient>,
    downloader: Arc<Downloader>,
    discovery: Arc<DiscoveryService>,
    lifecycle: Arc<LifecycleManager>,
    approvals: ApprovalGate,
    in_flight: Mutex<HashSet<String>>,
    removals: AtomicU64,
}

impl Installer {
    /// Creates an installer over the shared services.
    ///
    /// # Arguments
    /// * `registry` - Catalog client used to resolve entries
    /// * `downloader` - Fetches, verifies and places packages
    /// * `discovery` - Known plugin set
    /// * `lifecycle` - Records and persisted state
    /// * `approvals` - Where capability approvals are requested
    pub fn new(
        registry: Arc<RegistryClient>,
        downloader: Arc<Downloader>,
        discovery: Arc<DiscoveryService>,
        lifecycle: Arc<LifecycleManager>,
        approvals: ApprovalGate,
    ) -> Self {
        Self {
            registry,
            downloader,
            discovery,
            lifecycle,
            approvals,
            in_flight: Mutex::new(HashSet::new()),
            removals: AtomicU64::new(0),
        }
    }

    fn host_version(&self) -> &str {
        &self.discovery.options().host_version
    }

    /// Installs a catalog entry.
    ///
    /// # Arguments
    /// * `entry` - Catalog entry to install
    ///
    /// # Returns
    /// The new lifecycle record, enabled
    ///
    /// # Errors
    /// `DuplicateIdentifier` if the plugin is installed or being installed,
    /// `HostVersionIncompatible` before any prompt, `PermissionDenied` when the
    /// approval is denied (nothing is downloaded), otherwise the downloader's
    /// failure with its stage.
    pub async fn install(&self, entry: &CatalogEntry) -> Result<LifecycleRecord> {
        let _busy = InFlight::acquire(&self.in_flight, &entry.id)?;
        self.check_installable(entry)?;
        let granted = self.authorize(entry, &[]).await?;
        self.install_authorized(entry, granted).await
    }

    /// Looks the identifier up in the catalog and installs it.
    pub async fn install_by_id(&self, id: &str) -> Result<LifecycleRecord> {
        let entry = self.registry.entry(id).await?;
        self.install(&entry).await
    }

    /// Replaces an installed plugin with the catalog's newer version.
    ///
    /// Approval for the new capability set is obtained before the old
    /// version is touched. After that the old version is removed and the new
    /// one installed; if the install fails the plugin stays uninstalled.
    pub async fn update(&self, id: &str) -> Result<UpdateOutcome> {
        let _busy = InFlight::acquire(&self.in_flight, id)?;
        let installed = self.installed_plugin(id)?;
        if !self.removable(&installed) {
            return Err(PluginError::NotRemovable(id.to_string()));
        }

        let entry = self.registry.entry(id).await?;
        if !has_update(&installed.manifest, &entry) {
            debug!(plugin = %id, version = %installed.manifest.version, "Plugin is up to date");
            return Ok(UpdateOutcome::UpToDate { version: installed.manifest.version.clone() });
        }

        self.check_compatible(&entry)?;
        let previous = self.lifecycle.record(id);
        let previously_granted = previous.as_ref().map(|r| r.granted.clone()).unwrap_or_default();
        let was_disabled = previous.is_some_and(|r| !r.is_enabled());
        let granted = self.authorize(&entry, &previously_granted).await?;

        let from = installed.manifest.version.clone();
        info!(plugin = %id, from = %from, to = %entry.version, "Updating plugin");
        self.remove_installed(&installed).await?;

        if let Err(e) = self.install_authorized(&entry, granted).await {
            warn!(plugin = %id, error = %e, "Update failed after removing the old version; plugin is not installed");
            return Err(e);
        }
        if was_disabled {
            self.lifecycle.disable(id)?;
        }

        Ok(UpdateOutcome::Updated { from, to: entry.version.clone() })
    }

    /// Removes an installed plugin.
    ///
    /// # Errors
    /// `NotRemovable` for built-in and official plugins (state is left
    /// untouched), `NotFound` for unknown identifiers.
    pub async fn uninstall(&self, id: &str) -> Result<()> {
        let _busy = InFlight::acquire(&self.in_flight, id)?;
        let installed = self.installed_plugin(id)?;
        if !self.removable(&installed) {
            return Err(PluginError::NotRemovable(id.to_string()));
        }
        self.remove_installed(&installed).await?;
        info!(plugin = %id, "Plugin uninstalled");
        Ok(())
    }

    /// Enables a plugin, asking for consent first when it is missing.
    pub async fn enable(&self, id: &str) -> Result<LifecycleRecord> {
        let record = self.lifecycle.record(id).ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        if record.is_enabled() {
            return Ok(record);
        }

        let plugin = self.installed_plugin(id)?;
        if !plugin.assessment.is_covered_by(&record.granted) {
            self.request_approval(plugin.manifest.clone(), plugin.assessment.clone()).await?;
            self.lifecycle.grant(id, &plugin.assessment.consent_tokens())?;
        }
        self.lifecycle.enable(id)
    }

    /// Disables a plugin. No approval is needed.
    pub fn disable(&self, id: &str) -> Result<LifecycleRecord> {
        self.lifecycle.disable(id)
    }

    /// Cancels a running download. Returns false if none is live.
    pub fn cancel(&self, id: &str) -> bool {
        self.downloader.cancel(id)
    }

    /// Whether the catalog offers a newer version of an installed plugin.
    pub async fn has_update(&self, id: &str) -> Result<bool> {
        let installed = self.installed_plugin(id)?;
        let snapshot = self.registry.catalog(false).await?;
        Ok(snapshot.get(id).is_some_and(|entry| has_update(&installed.manifest, entry)))
    }

    /// Installed plugins with a newer catalog version, ordered by identifier.
    pub async fn outdated(&self) -> Result<Vec<OutdatedPlugin>> {
        let snapshot = self.registry.catalog(false).await?;
        let mut outdated = Vec::new();
        for plugin in self.discovery.known() {
            if let Some(entry) = snapshot.get(plugin.id()) {
                if has_update(&plugin.manifest, entry) {
                    outdated.push(OutdatedPlugin {
                        id: plugin.id().to_string(),
                        installed: plugin.manifest.version.clone(),
                        available: entry.version.clone(),
                    });
                }
            }
        }
        Ok(outdated)
    }

    fn installed_plugin(&self, id: &str) -> Result<DiscoveredPlugin> {
        self.lifecycle
            .plugin(id)
            .or_else(|| self.discovery.get(id))
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    fn removable(&self, plugin: &DiscoveredPlugin) -> bool {
        self.lifecycle.is_removable(plugin.id()).unwrap_or_else(|| plugin.is_removable())
    }

    fn check_installable(&self, entry: &CatalogEntry) -> Result<()> {
        entry
            .validate()
            .map_err(|reason| PluginError::ManifestInvalid(format!("{}: {}", entry.id, reason)))?;
        if self.discovery.is_known(&entry.id) || self.lifecycle.record(&entry.id).is_some() {
            return Err(PluginError::DuplicateIdentifier(entry.id.clone()));
        }
        self.check_compatible(entry)
    }

    fn check_compatible(&self, entry: &CatalogEntry) -> Result<()> {
        if satisfies_minimum(self.host_version(), &entry.min_host_version) {
            Ok(())
        } else {
            Err(PluginError::HostVersionIncompatible {
                id: entry.id.clone(),
                required: entry.min_host_version.clone(),
                host: self.host_version().to_string(),
            })
        }
    }

    /// Returns the consent tokens to record, prompting when `already_granted`
    /// does not cover the entry.
    async fn authorize(&self, entry: &CatalogEntry, already_granted: &[String]) -> Result<Vec<String>> {
        let assessment = entry.assess();
        if !assessment.requires_approval {
            return Ok(Vec::new());
        }
        if !already_granted.is_empty() && assessment.is_covered_by(already_granted) {
            return Ok(already_granted.to_vec());
        }

        let tokens = assessment.consent_tokens();
        self.request_approval(entry.to_manifest(), assessment).await?;
        Ok(tokens)
    }

    async fn request_approval(&self, manifest: PluginManifest, assessment: TrustAssessment) -> Result<()> {
        let id = manifest.id.clone();
        info!(plugin = %id, tier = %assessment.tier, "Waiting for capability approval");
        match self.approvals.request(manifest, assessment).await {
            ApprovalDecision::Approve => Ok(()),
            ApprovalDecision::Deny => {
                info!(plugin = %id, "Capability approval denied");
                Err(PluginError::PermissionDenied(id))
            }
        }
    }

    async fn install_authorized(&self, entry: &CatalogEntry, granted: Vec<String>) -> Result<LifecycleRecord> {
        let installed = self.downloader.start(entry).wait().await?;

        let plugin = match self.discovery.load(&installed.path, ManifestOrigin::Registry) {
            Ok(plugin) => plugin,
            Err(e) => {
                self.discard(&installed.path).await;
                return Err(PluginError::InstallFailed { id: entry.id.clone(), reason: e.to_string() });
            }
        };

        if let Err(e) = self.discovery.register(plugin.clone()) {
            self.discard(&installed.path).await;
            return Err(e);
        }

        match self.lifecycle.install_registered(plugin, granted) {
            Ok(record) => Ok(record),
            Err(e) => {
                self.discovery.unregister(&entry.id);
                self.discard(&installed.path).await;
                Err(e)
            }
        }
    }

    /// Moves the plugin directory into staging, then forgets it everywhere.
    async fn remove_installed(&self, plugin: &DiscoveredPlugin) -> Result<()> {
        let staging = self.downloader.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;

        let n = self.removals.fetch_add(1, Ordering::Relaxed);
        let graveyard = staging.join(format!("{}-removed-{}-{}", plugin.id(), std::process::id(), n));
        match tokio::fs::rename(&plugin.path, &graveyard).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(plugin = %plugin.id(), "Plugin directory already gone");
            }
            Err(e) => return Err(e.into()),
        }

        self.discovery.unregister(plugin.id());
        self.lifecycle.forget(plugin.id())?;
        self.discard(&graveyard).await;
        Ok(())
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Could not remove plugin files");
            }
        }
    }
}
