//! Opens the plugin system for a single command.

use tibok_core::PluginSystem;
use tibok_core::plugins::DiscoveryReport;
use tokio::task::JoinHandle;

use super::prompt::spawn_responder;
use crate::config::{ConfigOverrides, load_config};

/// A started plugin system plus the task answering its approval requests.
pub struct Session {
    pub system: PluginSystem,
    pub report: DiscoveryReport,
    responder: JoinHandle<()>,
}

impl Session {
    /// Loads configuration, builds the system and restores plugin state.
    pub async fn open(overrides: &ConfigOverrides, auto_approve: bool) -> anyhow::Result<Self> {
        let config = load_config(overrides)?;
        let (system, inbox) = PluginSystem::new(config)?;
        let report = system.start().await?;
        let responder = spawn_responder(inbox, auto_approve);
        Ok(Self { system, report, responder })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.responder.abort();
    }
}
