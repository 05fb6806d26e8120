//! Contribution registries.
//!
//! Command palette entries and slash commands declared in manifests are
//! exposed to the host through a [`ContributionRegistry`]. The registry
//! follows lifecycle notifications: enabling a plugin adds its entries,
//! disabling removes them.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use super::discovery::DiscoveredPlugin;
use super::lifecycle::LifecycleObserver;
use super::manifest::ContributedCommand;

/// Which manifest contribution list a registry follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContributionKind {
    Commands,
    SlashCommands,
}

/// A contributed entry together with the plugin that provided it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    /// Identifier of the contributing plugin.
    pub plugin_id: String,
    pub command: ContributedCommand,
}

/// Entries contributed by enabled plugins, keyed by plugin.
#[derive(Debug)]
pub struct ContributionRegistry {
    kind: ContributionKind,
    entries: RwLock<BTreeMap<String, Vec<ContributedCommand>>>,
}

impl ContributionRegistry {
    /// Empty registry for one contribution kind.
    pub fn new(kind: ContributionKind) -> Self {
        Self { kind, entries: RwLock::new(BTreeMap::new()) }
    }

    pub fn kind(&self) -> ContributionKind {
        self.kind
    }

    /// All entries, grouped by plugin identifier.
    pub fn entries(&self) -> Vec<Contribution> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flat_map(|(plugin_id, commands)| {
                commands.iter().map(move |command| Contribution {
                    plugin_id: plugin_id.clone(),
                    command: command.clone(),
                })
            })
            .collect()
    }

    /// Entries contributed by one plugin.
    pub fn entries_for(&self, plugin_id: &str) -> Vec<ContributedCommand> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Looks up an entry by its command identifier.
    pub fn find(&self, command_id: &str) -> Option<Contribution> {
        self.entries().into_iter().find(|c| c.command.id == command_id)
    }

    /// Number of entries across all plugins.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select<'a>(&self, plugin: &'a DiscoveredPlugin) -> &'a [ContributedCommand] {
        match self.kind {
            ContributionKind::Commands => &plugin.manifest.contributes.commands,
            ContributionKind::SlashCommands => &plugin.manifest.contributes.slash_commands,
        }
    }
}

impl LifecycleObserver for ContributionRegistry {
    fn plugin_enabled(&self, plugin: &DiscoveredPlugin) {
        let commands = self.select(plugin);
        if commands.is_empty() {
            return;
        }
        debug!(plugin = %plugin.id(), kind = ?self.kind, count = commands.len(), "Adding contributions");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin.id().to_string(), commands.to_vec());
    }

    fn plugin_disabled(&self, id: &str) {
        if self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(id).is_some() {
            debug!(plugin = %id, kind = ?self.kind, "Removed contributions");
        }
    }
}
