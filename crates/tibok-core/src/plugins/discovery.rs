//! Plugin discovery.
//!
//! Scans the built-in and user plugin directories, validates each manifest
//! and keeps the resulting set of known plugins. A broken package is recorded
//! in the report and skipped; it never stops the scan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::capability::{ManifestOrigin, TrustAssessment, TrustContext, TrustTier};
use super::error::{PluginError, Result};
use super::manifest::{MANIFEST_FILE, PluginManifest};
use super::package::InstallReceipt;
use super::signing::{PackageSigner, TrustedKeys};

/// A plugin found on disk with its resolved trust.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPlugin {
    /// Parsed and validated manifest.
    pub manifest: PluginManifest,
    /// Plugin directory.
    pub path: PathBuf,
    /// Where the plugin came from, after install receipt checks.
    pub origin: ManifestOrigin,
    /// The manifest signature verified against a trusted key.
    pub signature_verified: bool,
    /// Effective tier and capabilities, derived from the manifest and its origin.
    pub assessment: TrustAssessment,
}

impl DiscoveredPlugin {
    /// Wraps a loaded manifest and resolves its trust.
    ///
    /// # Arguments
    /// * `manifest` - The validated manifest
    /// * `path` - The plugin directory
    /// * `origin` - Where the directory was found
    /// * `signature_verified` - Whether the manifest signature checked out
    pub fn new(
        manifest: PluginManifest,
        path: PathBuf,
        origin: ManifestOrigin,
        signature_verified: bool,
    ) -> Self {
        let context = TrustContext::new(origin).with_verified_signature(signature_verified);
        let assessment = manifest.assess(context);
        Self { manifest, path, origin, signature_verified, assessment }
    }

    /// Plugin identifier from the manifest.
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Effective trust tier.
    pub fn tier(&self) -> TrustTier {
        self.assessment.tier
    }

    /// Built-in and official plugins can never be uninstalled.
    pub fn is_removable(&self) -> bool {
        self.origin != ManifestOrigin::Builtin && self.tier() != TrustTier::Official
    }
}

/// A directory to scan and the origin its plugins are attributed to.
#[derive(Debug, Clone)]
pub struct SearchLocation {
    pub path: PathBuf,
    /// `Builtin` for the bundled set. For the user directory use `Local`;
    /// plugins carrying an authentic install receipt are attributed to the registry.
    pub origin: ManifestOrigin,
}

impl SearchLocation {
    /// The bundled plugin set.
    pub fn builtin(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), origin: ManifestOrigin::Builtin }
    }

    /// The user plugin directory.
    pub fn user(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), origin: ManifestOrigin::Local }
    }
}

/// Discovery options.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Scanned in order; on duplicate identifiers the first location wins.
    pub locations: Vec<SearchLocation>,

    /// Host version used for `minHostVersion` checks.
    pub host_version: String,

    /// Keys whose install receipts are honoured, normally the host install key.
    pub receipt_keys: TrustedKeys,
}

/// A package that could not be loaded.
#[derive(Debug)]
pub struct DiscoveryFailure {
    /// Package directory.
    pub path: PathBuf,
    pub error: PluginError,
}

/// A second manifest claiming an identifier that was already found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateConflict {
    /// Identifier claimed twice.
    pub id: String,
    /// Directory of the plugin that was kept.
    pub kept: PathBuf,
    /// Directory of the plugin that was skipped.
    pub rejected: PathBuf,
}

impl DuplicateConflict {
    pub fn to_error(&self) -> PluginError {
        PluginError::DuplicateIdentifier(self.id.clone())
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Loaded plugins, in scan order.
    pub plugins: Vec<DiscoveredPlugin>,
    /// Keyed by plugin identifier when it could be read, else by directory name.
    pub failures: BTreeMap<String, DiscoveryFailure>,
    /// Identifiers claimed by more than one package.
    pub conflicts: Vec<DuplicateConflict>,
}

impl DiscoveryReport {
    /// Looks up a loaded plugin by identifier.
    pub fn get(&self, id: &str) -> Option<&DiscoveredPlugin> {
        self.plugins.iter().find(|p| p.id() == id)
    }

    fn record_failure(&mut self, key: String, path: &Path, error: PluginError) {
        warn!(plugin = %key, path = %path.display(), error = %error, "Skipping plugin");
        self.failures.entry(key).or_insert(DiscoveryFailure { path: path.to_path_buf(), error });
    }
}

/// Discovery service and owner of the known-plugin set.
pub struct DiscoveryService {
    options: DiscoveryOptions,
    trusted_keys: Arc<TrustedKeys>,
    known: RwLock<BTreeMap<String, DiscoveredPlugin>>,
}

impl DiscoveryService {
    /// Creates a service with an empty known set.
    ///
    /// # Arguments
    /// * `options` - Locations to scan and the host version
    /// * `trusted_keys` - Keys accepted for manifest signatures
    pub fn new(options: DiscoveryOptions, trusted_keys: Arc<TrustedKeys>) -> Self {
        Self { options, trusted_keys, known: RwLock::new(BTreeMap::new()) }
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// Scans every location off the async runtime and replaces the known set.
    pub async fn discover(&self) -> Result<DiscoveryReport> {
        let options = self.options.clone();
        let keys = Arc::clone(&self.trusted_keys);
        let report = tokio::task::spawn_blocking(move || scan(&options, &keys))
            .await
            .map_err(|e| PluginError::Io(std::io::Error::other(e)))?;

        let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
        known.clear();
        for plugin in &report.plugins {
            known.insert(plugin.id().to_string(), plugin.clone());
        }

        info!(
            found = report.plugins.len(),
            failed = report.failures.len(),
            conflicts = report.conflicts.len(),
            "Plugin discovery complete"
        );
        Ok(report)
    }

    /// Known plugin by identifier.
    pub fn get(&self, id: &str) -> Option<DiscoveredPlugin> {
        self.known.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Whether a plugin with this identifier is known.
    pub fn is_known(&self, id: &str) -> bool {
        self.known.read().unwrap_or_else(PoisonError::into_inner).contains_key(id)
    }

    /// Known plugins ordered by identifier.
    pub fn known(&self) -> Vec<DiscoveredPlugin> {
        self.known.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    /// Adds a freshly installed plugin to the known set.
    ///
    /// A known plugin loaded from the same directory, as left by a rescan
    /// that ran during the install, is replaced. Any other plugin already
    /// known under this id is a `DuplicateIdentifier`.
    pub fn register(&self, plugin: DiscoveredPlugin) -> Result<()> {
        let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = known.get(plugin.id()) {
            if existing.path != plugin.path {
                return Err(PluginError::DuplicateIdentifier(plugin.id().to_string()));
            }
            debug!(plugin = %plugin.id(), "Plugin already picked up by a rescan");
        }
        debug!(plugin = %plugin.id(), "Registered plugin");
        known.insert(plugin.id().to_string(), plugin);
        Ok(())
    }

    /// Forgets a plugin.
    ///
    /// # Returns
    /// The removed plugin, or `None` if it was not known.
    pub fn unregister(&self, id: &str) -> Option<DiscoveredPlugin> {
        self.known.write().unwrap_or_else(PoisonError::into_inner).remove(id)
    }

    /// Loads a single plugin directory with the same checks a scan applies.
    pub fn load(&self, dir: &Path, origin: ManifestOrigin) -> Result<DiscoveredPlugin> {
        load_plugin(dir, origin, &self.options, &self.trusted_keys).map_err(|(_, error)| error)
    }
}

/// Synchronous scan of all locations.
pub fn scan(options: &DiscoveryOptions, trusted_keys: &TrustedKeys) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    for location in &options.locations {
        for dir in plugin_dirs(&location.path, &mut report) {
            let dir_name = dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

            let plugin = match load_plugin(&dir, location.origin, options, trusted_keys) {
                Ok(plugin) => plugin,
                Err((key, error)) => {
                    report.record_failure(key.unwrap_or(dir_name), &dir, error);
                    continue;
                }
            };

            if let Some(existing) = report.get(plugin.id()) {
                let conflict = DuplicateConflict {
                    id: plugin.id().to_string(),
                    kept: existing.path.clone(),
                    rejected: dir.clone(),
                };
                warn!(
                    plugin = %conflict.id,
                    kept = %conflict.kept.display(),
                    rejected = %conflict.rejected.display(),
                    "Duplicate plugin identifier"
                );
                report.conflicts.push(conflict);
                continue;
            }

            debug!(plugin = %plugin.id(), tier = %plugin.tier(), "Discovered plugin");
            report.plugins.push(plugin);
        }
    }

    report
}

/// Candidate plugin directories in name order. Hidden entries are skipped.
fn plugin_dirs(root: &Path, report: &mut DiscoveryReport) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            let key = root.display().to_string();
            report.record_failure(key, root, PluginError::Io(e));
            return Vec::new();
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

type LoadError = (Option<String>, PluginError);

fn load_plugin(
    dir: &Path,
    location_origin: ManifestOrigin,
    options: &DiscoveryOptions,
    trusted_keys: &TrustedKeys,
) -> std::result::Result<DiscoveredPlugin, LoadError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
        let reason = if e.kind() == std::io::ErrorKind::NotFound {
            format!("{} not found", MANIFEST_FILE)
        } else {
            format!("cannot read {}: {}", MANIFEST_FILE, e)
        };
        (None, PluginError::ManifestInvalid(reason))
    })?;

    let manifest = PluginManifest::from_json(&content)
        .map_err(|e| (PluginManifest::peek_identifier(&content), PluginError::from(e)))?;
    let id = Some(manifest.id.clone());

    if !manifest.is_compatible_with(&options.host_version) {
        return Err((
            id,
            PluginError::HostVersionIncompatible {
                id: manifest.id.clone(),
                required: manifest.min_host_version.clone(),
                host: options.host_version.clone(),
            },
        ));
    }

    let signature_verified = trusted_keys.verify_manifest(&manifest).map_err(|e| {
        (id.clone(), PluginError::VerificationFailed { id: manifest.id.clone(), reason: e.to_string() })
    })?;

    let origin = match location_origin {
        ManifestOrigin::Builtin => ManifestOrigin::Builtin,
        ManifestOrigin::Registry | ManifestOrigin::Local => match InstallReceipt::load(dir) {
            Some(receipt) if receipt.origin == ManifestOrigin::Registry => {
                if receipt.is_authentic(dir, &options.receipt_keys) {
                    ManifestOrigin::Registry
                } else {
                    warn!(path = %dir.display(), "Ignoring install receipt not issued by this host");
                    location_origin
                }
            }
            _ => location_origin,
        },
    };

    Ok(DiscoveredPlugin::new(manifest, dir.to_path_buf(), origin, signature_verified))
}
