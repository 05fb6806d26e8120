//! Plugin lifecycle state.
//!
//! [`LifecycleManager`] is the single owner of per-plugin lifecycle records
//! and the only writer of the persisted enabled state. Each identifier moves
//! `Discovered → Enabled | Disabled`; enable/disable are idempotent and hit
//! the store before they return. Consumers that contribute commands or other
//! entries on behalf of plugins register a [`LifecycleObserver`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::capability::ManifestOrigin;
use super::discovery::DiscoveredPlugin;
use super::error::{PluginError, Result};

/// Persisted state of one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPluginState {
    /// Whether the plugin was enabled when last persisted.
    pub enabled: bool,
    /// Capability tokens the user consented to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub granted: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    plugins: BTreeMap<String, StoredPluginState>,
}

/// Backing store for lifecycle state.
pub trait LifecycleStore: Send + Sync {
    fn load(&self) -> Result<BTreeMap<String, StoredPluginState>>;

    /// Replaces (or with `None`, removes) the record for `id`.
    ///
    /// Records of other plugins are left as they are in the store. `snapshot`
    /// is the caller's complete view after the change; a store whose
    /// contents cannot be read is rebuilt from it instead of being emptied.
    fn save(
        &self,
        id: &str,
        state: Option<&StoredPluginState>,
        snapshot: &BTreeMap<String, StoredPluginState>,
    ) -> Result<()>;
}

/// JSON file store, rewritten atomically on every save.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Store backed by the JSON file at `path`. The file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where an unreadable store is moved before it is rebuilt.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".corrupt");
        self.path.with_file_name(name)
    }

    fn read_document(&self) -> Result<StoreDocument> {
        if !self.path.exists() {
            return Ok(StoreDocument::default());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| PluginError::Store(format!("reading {}: {}", self.path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(StoreDocument::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| PluginError::Store(format!("parsing {}: {}", self.path.display(), e)))
    }

    fn write_document(&self, document: &StoreDocument) -> Result<()> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;

        let content = serde_json::to_string_pretty(document).map_err(|e| PluginError::Store(e.to_string()))?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(content.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|e| PluginError::Store(format!("replacing {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

impl LifecycleStore for JsonFileStore {
    fn load(&self) -> Result<BTreeMap<String, StoredPluginState>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_document()?.plugins)
    }

    fn save(
        &self,
        id: &str,
        state: Option<&StoredPluginState>,
        snapshot: &BTreeMap<String, StoredPluginState>,
    ) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = match self.read_document() {
            Ok(document) => document,
            Err(e) => {
                let backup = self.backup_path();
                warn!(
                    error = %e,
                    backup = %backup.display(),
                    records = snapshot.len(),
                    "Lifecycle store unreadable, rebuilding it from memory"
                );
                fs::rename(&self.path, &backup)?;
                StoreDocument { plugins: snapshot.clone() }
            }
        };
        match state {
            Some(state) => {
                document.plugins.insert(id.to_string(), state.clone());
            }
            None => {
                document.plugins.remove(id);
            }
        }
        self.write_document(&document)
    }
}

/// In-memory store for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, StoredPluginState>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with records, for hosts that persist elsewhere.
    pub fn with_records(records: BTreeMap<String, StoredPluginState>) -> Self {
        Self { records: Mutex::new(records) }
    }
}

impl LifecycleStore for MemoryStore {
    fn load(&self) -> Result<BTreeMap<String, StoredPluginState>> {
        Ok(self.records.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(
        &self,
        id: &str,
        state: Option<&StoredPluginState>,
        _snapshot: &BTreeMap<String, StoredPluginState>,
    ) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match state {
            Some(state) => records.insert(id.to_string(), state.clone()),
            None => records.remove(id),
        };
        Ok(())
    }
}

/// Lifecycle state of a known plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Known, with no enable/disable decision yet.
    Discovered,
    Enabled,
    Disabled,
}

/// Lifecycle record of one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRecord {
    /// Plugin identifier.
    pub id: String,
    /// Current lifecycle state.
    pub state: PluginState,
    /// Whether the plugin may be uninstalled.
    pub removable: bool,
    /// Most recent runtime error reported by the plugin.
    pub last_error: Option<String>,
    /// Capability tokens the user consented to.
    pub granted: Vec<String>,
}

impl LifecycleRecord {
    /// Whether the plugin is enabled, with or without a runtime error.
    pub fn is_enabled(&self) -> bool {
        self.state == PluginState::Enabled
    }

    /// Enabled and without a recorded runtime error.
    pub fn is_functional(&self) -> bool {
        self.is_enabled() && self.last_error.is_none()
    }
}

/// Receives enable/disable notifications.
///
/// Delivered in the order the transitions happened, with no other transition
/// in progress. Observers may read from the manager but must not change
/// lifecycle state from inside a callback.
pub trait LifecycleObserver: Send + Sync {
    fn plugin_enabled(&self, plugin: &DiscoveredPlugin);
    fn plugin_disabled(&self, id: &str);
}

/// Handle returned by [`LifecycleManager::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

enum Notification {
    Enabled(DiscoveredPlugin),
    Disabled(String),
}

struct Tracked {
    plugin: DiscoveredPlugin,
    record: LifecycleRecord,
}

#[derive(Default)]
struct Inner {
    persisted: BTreeMap<String, StoredPluginState>,
    tracked: BTreeMap<String, Tracked>,
}

/// Owner of lifecycle records.
pub struct LifecycleManager {
    store: Arc<dyn LifecycleStore>,
    /// Held for a whole transition, from the state change until observers ran.
    delivery: Mutex<()>,
    inner: Mutex<Inner>,
    observers: Mutex<Vec<(ObserverId, Arc<dyn LifecycleObserver>)>>,
    next_observer: AtomicU64,
}

impl LifecycleManager {
    /// Creates a manager, restoring persisted state.
    ///
    /// An unreadable store is logged and treated as empty.
    pub fn new(store: Arc<dyn LifecycleStore>) -> Self {
        let persisted = store.load().unwrap_or_else(|e| {
            warn!(error = %e, "Could not restore plugin lifecycle state");
            BTreeMap::new()
        });
        debug!(records = persisted.len(), "Restored plugin lifecycle state");

        Self {
            store,
            delivery: Mutex::new(()),
            inner: Mutex::new(Inner { persisted, tracked: BTreeMap::new() }),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    /// Rebuilds records from a discovery pass.
    ///
    /// Persisted enabled flags are honoured only when the recorded consent
    /// still covers the plugin's capabilities. Built-in plugins without a
    /// persisted record start enabled. Runtime errors are cleared.
    pub fn sync_discovered(&self, plugins: &[DiscoveredPlugin]) {
        let _delivery = self.lock_delivery();
        let mut notifications = Vec::new();
        {
            let mut inner = self.lock_inner();
            let mut previous = std::mem::take(&mut inner.tracked);

            for plugin in plugins {
                let stored = inner.persisted.get(plugin.id()).cloned();
                let granted = stored.as_ref().map(|s| s.granted.clone()).unwrap_or_default();
                let state = match stored {
                    Some(stored) if stored.enabled => {
                        if plugin.assessment.is_covered_by(&granted) {
                            PluginState::Enabled
                        } else {
                            warn!(plugin = %plugin.id(), "Capabilities changed since consent, keeping plugin disabled");
                            PluginState::Disabled
                        }
                    }
                    Some(_) => PluginState::Disabled,
                    None if plugin.origin == ManifestOrigin::Builtin => PluginState::Enabled,
                    None => PluginState::Discovered,
                };

                let was_enabled = previous
                    .remove(plugin.id())
                    .is_some_and(|t| t.record.is_enabled());
                if state == PluginState::Enabled {
                    // Re-announce so observers pick up changed contributions.
                    if was_enabled {
                        notifications.push(Notification::Disabled(plugin.id().to_string()));
                    }
                    notifications.push(Notification::Enabled(plugin.clone()));
                } else if was_enabled {
                    notifications.push(Notification::Disabled(plugin.id().to_string()));
                }

                let record = LifecycleRecord {
                    id: plugin.id().to_string(),
                    state,
                    removable: plugin.is_removable(),
                    last_error: None,
                    granted,
                };
                inner.tracked.insert(plugin.id().to_string(), Tracked { plugin: plugin.clone(), record });
            }

            for (id, gone) in previous {
                if gone.record.is_enabled() {
                    notifications.push(Notification::Disabled(id));
                }
            }
        }

        info!(plugins = plugins.len(), "Plugin lifecycle state synchronised");
        self.notify(notifications);
    }

    /// Tracks a freshly installed plugin as enabled with the given consent.
    ///
    /// The record is persisted first; if that fails nothing is tracked.
    /// A record synced from the same directory by a rescan that ran during
    /// the install is taken over; any other record under this id is a
    /// `DuplicateIdentifier`.
    pub fn install_registered(&self, plugin: DiscoveredPlugin, granted: Vec<String>) -> Result<LifecycleRecord> {
        let _delivery = self.lock_delivery();
        let (record, was_enabled) = {
            let mut inner = self.lock_inner();
            let was_enabled = match inner.tracked.get(plugin.id()) {
                Some(existing) if existing.plugin.path != plugin.path => {
                    return Err(PluginError::DuplicateIdentifier(plugin.id().to_string()));
                }
                Some(existing) => existing.record.is_enabled(),
                None => false,
            };

            let stored = StoredPluginState { enabled: true, granted: granted.clone() };
            self.persist(&mut inner.persisted, plugin.id(), Some(stored))?;

            let record = LifecycleRecord {
                id: plugin.id().to_string(),
                state: PluginState::Enabled,
                removable: plugin.is_removable(),
                last_error: None,
                granted,
            };
            inner.tracked.insert(
                plugin.id().to_string(),
                Tracked { plugin: plugin.clone(), record: record.clone() },
            );
            (record, was_enabled)
        };

        info!(plugin = %plugin.id(), "Plugin installed and enabled");
        let mut notifications = Vec::new();
        if was_enabled {
            notifications.push(Notification::Disabled(plugin.id().to_string()));
        }
        notifications.push(Notification::Enabled(plugin));
        self.notify(notifications);
        Ok(record)
    }

    /// Enables a plugin. No-op when already enabled.
    ///
    /// Fails with `PermissionDenied` when the plugin needs consent that has
    /// not been granted; see [`LifecycleManager::grant`].
    pub fn enable(&self, id: &str) -> Result<LifecycleRecord> {
        let _delivery = self.lock_delivery();
        let (record, plugin) = {
            let mut inner = self.lock_inner();
            let Inner { persisted, tracked } = &mut *inner;
            let tracked = tracked.get_mut(id).ok_or_else(|| PluginError::NotFound(id.to_string()))?;

            if tracked.record.is_enabled() {
                return Ok(tracked.record.clone());
            }
            if !tracked.plugin.assessment.is_covered_by(&tracked.record.granted) {
                return Err(PluginError::PermissionDenied(id.to_string()));
            }

            let stored = StoredPluginState { enabled: true, granted: tracked.record.granted.clone() };
            self.persist(persisted, id, Some(stored))?;
            tracked.record.state = PluginState::Enabled;
            (tracked.record.clone(), tracked.plugin.clone())
        };

        info!(plugin = %id, "Plugin enabled");
        self.notify(vec![Notification::Enabled(plugin)]);
        Ok(record)
    }

    /// Disables a plugin. No-op when already disabled.
    pub fn disable(&self, id: &str) -> Result<LifecycleRecord> {
        let _delivery = self.lock_delivery();
        let (record, was_enabled) = {
            let mut inner = self.lock_inner();
            let Inner { persisted, tracked } = &mut *inner;
            let tracked = tracked.get_mut(id).ok_or_else(|| PluginError::NotFound(id.to_string()))?;

            if tracked.record.state == PluginState::Disabled {
                return Ok(tracked.record.clone());
            }

            let stored = StoredPluginState { enabled: false, granted: tracked.record.granted.clone() };
            self.persist(persisted, id, Some(stored))?;
            let was_enabled = tracked.record.is_enabled();
            tracked.record.state = PluginState::Disabled;
            (tracked.record.clone(), was_enabled)
        };

        info!(plugin = %id, "Plugin disabled");
        if was_enabled {
            self.notify(vec![Notification::Disabled(id.to_string())]);
        }
        Ok(record)
    }

    /// Records consent for capability tokens, keeping earlier grants.
    pub fn grant(&self, id: &str, tokens: &[String]) -> Result<()> {
        let mut inner = self.lock_inner();
        let Inner { persisted, tracked } = &mut *inner;
        let tracked = tracked.get_mut(id).ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        let mut granted = tracked.record.granted.clone();
        for token in tokens {
            if !granted.contains(token) {
                granted.push(token.clone());
            }
        }
        let stored = StoredPluginState { enabled: tracked.record.is_enabled(), granted: granted.clone() };
        self.persist(persisted, id, Some(stored))?;
        tracked.record.granted = granted;
        debug!(plugin = %id, "Capability consent recorded");
        Ok(())
    }

    /// Drops the record and its persisted state. Returns the removed record.
    pub fn forget(&self, id: &str) -> Result<Option<LifecycleRecord>> {
        let _delivery = self.lock_delivery();
        let removed = {
            let mut inner = self.lock_inner();
            if !inner.persisted.contains_key(id) && !inner.tracked.contains_key(id) {
                return Ok(None);
            }
            self.persist(&mut inner.persisted, id, None)?;
            inner.tracked.remove(id).map(|t| t.record)
        };

        if removed.as_ref().is_some_and(LifecycleRecord::is_enabled) {
            self.notify(vec![Notification::Disabled(id.to_string())]);
        }
        debug!(plugin = %id, "Lifecycle record removed");
        Ok(removed)
    }

    /// Captures a runtime error reported by a plugin. Returns false for unknown plugins.
    pub fn record_error(&self, id: &str, error: impl Into<String>) -> bool {
        let mut inner = self.lock_inner();
        match inner.tracked.get_mut(id) {
            Some(tracked) => {
                let error = error.into();
                warn!(plugin = %id, error = %error, "Plugin reported a runtime error");
                tracked.record.last_error = Some(error);
                true
            }
            None => false,
        }
    }

    /// Clears the recorded error after a successful reload.
    pub fn clear_error(&self, id: &str) -> bool {
        let mut inner = self.lock_inner();
        match inner.tracked.get_mut(id) {
            Some(tracked) => {
                tracked.record.last_error = None;
                true
            }
            None => false,
        }
    }

    /// Record of a tracked plugin.
    ///
    /// # Returns
    /// A copy of the record, or `None` for unknown identifiers.
    pub fn record(&self, id: &str) -> Option<LifecycleRecord> {
        self.lock_inner().tracked.get(id).map(|t| t.record.clone())
    }

    /// All records ordered by identifier.
    pub fn records(&self) -> Vec<LifecycleRecord> {
        self.lock_inner().tracked.values().map(|t| t.record.clone()).collect()
    }

    /// The discovered plugin behind a record.
    pub fn plugin(&self, id: &str) -> Option<DiscoveredPlugin> {
        self.lock_inner().tracked.get(id).map(|t| t.plugin.clone())
    }

    /// Whether the plugin is enabled and healthy. `false` for unknown identifiers.
    pub fn is_functional(&self, id: &str) -> bool {
        self.record(id).is_some_and(|r| r.is_functional())
    }

    /// Whether a tracked plugin may be uninstalled; `None` for unknown identifiers.
    pub fn is_removable(&self, id: &str) -> Option<bool> {
        self.record(id).map(|r| r.removable)
    }

    /// Registers an observer and replays every currently enabled plugin to it.
    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) -> ObserverId {
        let _delivery = self.lock_delivery();
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        let enabled: Vec<DiscoveredPlugin> = self
            .lock_inner()
            .tracked
            .values()
            .filter(|t| t.record.is_enabled())
            .map(|t| t.plugin.clone())
            .collect();

        for plugin in &enabled {
            observer.plugin_enabled(plugin);
        }
        self.observers.lock().unwrap_or_else(PoisonError::into_inner).push((id, observer));
        id
    }

    /// Stops delivering transitions to an observer.
    ///
    /// # Returns
    /// `false` if the observer was already removed.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Writes one record through to the store, then to the in-memory copy.
    fn persist(
        &self,
        persisted: &mut BTreeMap<String, StoredPluginState>,
        id: &str,
        state: Option<StoredPluginState>,
    ) -> Result<()> {
        let mut next = persisted.clone();
        match &state {
            Some(state) => {
                next.insert(id.to_string(), state.clone());
            }
            None => {
                next.remove(id);
            }
        }
        self.store.save(id, state.as_ref(), &next)?;
        *persisted = next;
        Ok(())
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let observers: Vec<Arc<dyn LifecycleObserver>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();

        for notification in &notifications {
            for observer in &observers {
                match notification {
                    Notification::Enabled(plugin) => observer.plugin_enabled(plugin),
                    Notification::Disabled(id) => observer.plugin_disabled(id),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::PluginManifest;
    use std::time::Duration;
    use tempfile::TempDir;

    fn plugin(id: &str, capabilities: &str, origin: ManifestOrigin) -> DiscoveredPlugin {
        let manifest = PluginManifest::from_json(&format!(
            r#"{{"id": "{id}", "name": "{id}", "version": "1.0.0", "minHostVersion": "0.1",
                "kind": "script", "capabilities": {capabilities}}}"#
        ))
        .unwrap();
        DiscoveredPlugin::new(manifest, PathBuf::from(id), origin, false)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        enable_delay: Option<Duration>,
    }

    impl LifecycleObserver for Recorder {
        fn plugin_enabled(&self, plugin: &DiscoveredPlugin) {
            if let Some(delay) = self.enable_delay {
                std::thread::sleep(delay);
            }
            self.events.lock().unwrap().push(format!("+{}", plugin.id()));
        }

        fn plugin_disabled(&self, id: &str) {
            self.events.lock().unwrap().push(format!("-{}", id));
        }
    }

    #[test]
    fn test_json_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("nested").join("state.json"));
        assert!(store.load().unwrap().is_empty());

        let unused = BTreeMap::new();
        let state = StoredPluginState { enabled: true, granted: vec!["network".to_string()] };
        store.save("com.example.a", Some(&state), &unused).unwrap();
        store.save("com.example.b", Some(&StoredPluginState::default()), &unused).unwrap();
        store.save("com.example.b", None, &unused).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["com.example.a"], state);

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"plugins\""));
    }

    #[test]
    fn test_corrupt_store_is_an_error_but_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        let store = Arc::new(JsonFileStore::new(&path));
        assert!(matches!(store.load(), Err(PluginError::Store(_))));

        let manager = LifecycleManager::new(store.clone());
        manager.sync_discovered(&[plugin("com.example.a", "[]", ManifestOrigin::Local)]);
        manager.enable("com.example.a").unwrap();
        assert!(store.load().unwrap()["com.example.a"].enabled);
        assert_eq!(fs::read_to_string(store.backup_path()).unwrap(), "{not json");
    }

    #[test]
    fn test_unreadable_store_is_rebuilt_from_memory() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFileStore::new(temp_dir.path().join("state.json")));
        let manager = LifecycleManager::new(store.clone());
        manager.sync_discovered(&[
            plugin("com.example.a", "[]", ManifestOrigin::Local),
            plugin("com.example.b", "[]", ManifestOrigin::Local),
            plugin("com.example.c", "[]", ManifestOrigin::Local),
        ]);
        manager.enable("com.example.a").unwrap();
        manager.disable("com.example.b").unwrap();

        fs::write(store.path(), "truncated{").unwrap();
        manager.enable("com.example.c").unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded["com.example.a"].enabled);
        assert!(!loaded["com.example.b"].enabled);
        assert!(loaded["com.example.c"].enabled);
        assert!(store.backup_path().exists());
    }

    #[test]
    fn test_default_states() {
        let manager = LifecycleManager::new(Arc::new(MemoryStore::new()));
        manager.sync_discovered(&[
            plugin("com.tibok.core", r#"["process"]"#, ManifestOrigin::Builtin),
            plugin("com.example.side", "[]", ManifestOrigin::Local),
        ]);

        let core = manager.record("com.tibok.core").unwrap();
        assert_eq!(core.state, PluginState::Enabled);
        assert!(!core.removable);

        let side = manager.record("com.example.side").unwrap();
        assert_eq!(side.state, PluginState::Discovered);
        assert!(side.removable);
    }

    #[test]
    fn test_persisted_state_is_restored() {
        let store = Arc::new(MemoryStore::new());
        let plugins = [plugin("com.example.a", r#"["network"]"#, ManifestOrigin::Registry)];

        let manager = LifecycleManager::new(store.clone());
        manager.sync_discovered(&plugins);
        manager.grant("com.example.a", &["network".to_string()]).unwrap();
        manager.enable("com.example.a").unwrap();

        let restarted = LifecycleManager::new(store);
        restarted.sync_discovered(&plugins);
        assert_eq!(restarted.record("com.example.a").unwrap().state, PluginState::Enabled);
    }

    #[test]
    fn test_changed_capabilities_need_new_consent() {
        let mut records = BTreeMap::new();
        records.insert(
            "com.example.a".to_string(),
            StoredPluginState { enabled: true, granted: vec!["network".to_string()] },
        );
        let manager = LifecycleManager::new(Arc::new(MemoryStore::with_records(records)));
        manager.sync_discovered(&[plugin("com.example.a", r#"["network", "process"]"#, ManifestOrigin::Registry)]);

        assert_eq!(manager.record("com.example.a").unwrap().state, PluginState::Disabled);
        assert!(matches!(manager.enable("com.example.a"), Err(PluginError::PermissionDenied(_))));

        manager.grant("com.example.a", &["process".to_string()]).unwrap();
        assert!(manager.enable("com.example.a").unwrap().is_enabled());
    }

    #[test]
    fn test_enable_disable_are_idempotent_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let manager = LifecycleManager::new(store.clone());
        let recorder = Arc::new(Recorder::default());
        manager.add_observer(recorder.clone());
        manager.sync_discovered(&[plugin("com.example.a", "[]", ManifestOrigin::Local)]);

        manager.enable("com.example.a").unwrap();
        manager.enable("com.example.a").unwrap();
        assert!(store.load().unwrap()["com.example.a"].enabled);

        manager.disable("com.example.a").unwrap();
        manager.disable("com.example.a").unwrap();
        assert!(!store.load().unwrap()["com.example.a"].enabled);

        assert_eq!(*recorder.events.lock().unwrap(), vec!["+com.example.a", "-com.example.a"]);
        assert!(matches!(manager.enable("com.example.missing"), Err(PluginError::NotFound(_))));
    }

    #[test]
    fn test_runtime_errors_are_isolated() {
        let manager = LifecycleManager::new(Arc::new(MemoryStore::new()));
        manager.sync_discovered(&[
            plugin("com.example.a", "[]", ManifestOrigin::Builtin),
            plugin("com.example.b", "[]", ManifestOrigin::Builtin),
        ]);

        assert!(manager.record_error("com.example.a", "script panicked"));
        assert!(!manager.is_functional("com.example.a"));
        assert!(manager.is_functional("com.example.b"));
        assert!(!manager.record_error("com.example.missing", "x"));

        manager.sync_discovered(&[
            plugin("com.example.a", "[]", ManifestOrigin::Builtin),
            plugin("com.example.b", "[]", ManifestOrigin::Builtin),
        ]);
        assert!(manager.is_functional("com.example.a"));
    }

    #[test]
    fn test_install_registered_and_forget() {
        let store = Arc::new(MemoryStore::new());
        let manager = LifecycleManager::new(store.clone());
        let recorder = Arc::new(Recorder::default());
        let observer = manager.add_observer(recorder.clone());

        let record = manager
            .install_registered(
                plugin("com.example.a", r#"["network"]"#, ManifestOrigin::Registry),
                vec!["network".to_string()],
            )
            .unwrap();
        assert!(record.is_enabled());
        assert_eq!(store.load().unwrap()["com.example.a"].granted, vec!["network"]);

        let removed = manager.forget("com.example.a").unwrap().unwrap();
        assert_eq!(removed.id, "com.example.a");
        assert!(manager.record("com.example.a").is_none());
        assert!(store.load().unwrap().is_empty());
        assert_eq!(*recorder.events.lock().unwrap(), vec!["+com.example.a", "-com.example.a"]);

        assert!(manager.remove_observer(observer));
        assert!(!manager.remove_observer(observer));
    }

    #[test]
    fn test_install_takes_over_record_from_racing_rescan() {
        let store = Arc::new(MemoryStore::new());
        let manager = LifecycleManager::new(store.clone());
        let recorder = Arc::new(Recorder::default());
        manager.add_observer(recorder.clone());

        let installed = plugin("com.example.a", r#"["network"]"#, ManifestOrigin::Registry);
        manager.sync_discovered(std::slice::from_ref(&installed));
        assert_eq!(manager.record("com.example.a").unwrap().state, PluginState::Discovered);

        let record = manager.install_registered(installed, vec!["network".to_string()]).unwrap();
        assert!(record.is_enabled());
        assert!(store.load().unwrap()["com.example.a"].enabled);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["+com.example.a"]);

        let mut elsewhere = plugin("com.example.a", "[]", ManifestOrigin::Local);
        elsewhere.path = PathBuf::from("elsewhere");
        assert!(matches!(
            manager.install_registered(elsewhere, Vec::new()),
            Err(PluginError::DuplicateIdentifier(_))
        ));
        assert_eq!(manager.record("com.example.a").unwrap().granted, vec!["network"]);
    }

    #[test]
    fn test_new_observer_receives_enabled_plugins() {
        let manager = LifecycleManager::new(Arc::new(MemoryStore::new()));
        manager.sync_discovered(&[
            plugin("com.example.a", "[]", ManifestOrigin::Builtin),
            plugin("com.example.b", "[]", ManifestOrigin::Local),
        ]);

        let recorder = Arc::new(Recorder::default());
        manager.add_observer(recorder.clone());
        assert_eq!(*recorder.events.lock().unwrap(), vec!["+com.example.a"]);
    }

    #[test]
    fn test_slow_observer_sees_transitions_in_order() {
        let manager = Arc::new(LifecycleManager::new(Arc::new(MemoryStore::new())));
        let recorder = Arc::new(Recorder {
            enable_delay: Some(Duration::from_millis(300)),
            ..Recorder::default()
        });
        manager.add_observer(recorder.clone());
        manager.sync_discovered(&[plugin("com.example.a", "[]", ManifestOrigin::Local)]);

        let enabling = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.enable("com.example.a").map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(80));
        manager.disable("com.example.a").unwrap();
        enabling.join().unwrap().unwrap();

        assert_eq!(manager.record("com.example.a").unwrap().state, PluginState::Disabled);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["+com.example.a", "-com.example.a"]);
    }
}
