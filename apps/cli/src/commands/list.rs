//! `list` command.

use colored::Colorize;
use serde_json::json;
use tabled::{Table, Tabled, settings::Style};
use tibok_core::plugins::PluginState;

use super::system::Session;
use crate::config::ConfigOverrides;

#[derive(Tabled)]
struct PluginRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Status")]
    status: String,
}

fn state_label(state: PluginState) -> &'static str {
    match state {
        PluginState::Discovered => "discovered",
        PluginState::Enabled => "enabled",
        PluginState::Disabled => "disabled",
    }
}

/// List every discovered plugin with its lifecycle state.
pub async fn execute(overrides: &ConfigOverrides, json_output: bool) -> anyhow::Result<()> {
    let session = Session::open(overrides, false).await?;
    let lifecycle = session.system.lifecycle();
    let report = &session.report;

    let mut plugins: Vec<_> = report.plugins.iter().collect();
    plugins.sort_by(|a, b| a.id().cmp(b.id()));

    if json_output {
        let list: Vec<_> = plugins
            .iter()
            .map(|plugin| {
                let record = lifecycle.record(plugin.id());
                json!({
                    "id": plugin.id(),
                    "name": plugin.manifest.name,
                    "version": plugin.manifest.version,
                    "tier": plugin.tier(),
                    "origin": plugin.origin,
                    "path": plugin.path,
                    "state": record.as_ref().map(|r| r.state),
                    "functional": record.as_ref().is_some_and(|r| r.is_functional()),
                    "capabilities": plugin.manifest.capabilities,
                })
            })
            .collect();
        let failures: Vec<_> = report
            .failures
            .iter()
            .map(|(key, failure)| {
                json!({ "key": key, "path": failure.path, "error": failure.error.to_string() })
            })
            .collect();
        let conflicts: Vec<_> = report
            .conflicts
            .iter()
            .map(|c| json!({ "id": c.id, "kept": c.kept, "rejected": c.rejected }))
            .collect();
        let output = json!({ "plugins": list, "failures": failures, "conflicts": conflicts });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if plugins.is_empty() {
        println!("{}", "No plugins installed.".yellow());
        println!();
        println!("{}", "Get started:".bright_black());
        println!("  $ tibok-ext search");
        println!("  $ tibok-ext install <id>");
    } else {
        let rows: Vec<PluginRow> = plugins
            .iter()
            .map(|plugin| {
                let record = lifecycle.record(plugin.id());
                let status = match &record {
                    Some(r) if r.last_error.is_some() => "error",
                    Some(r) if r.is_functional() => "ok",
                    _ => "-",
                };
                PluginRow {
                    id: plugin.id().to_string(),
                    name: plugin.manifest.name.clone(),
                    version: plugin.manifest.version.clone(),
                    tier: plugin.tier().to_string(),
                    state: record.map_or("-", |r| state_label(r.state)).to_string(),
                    status: status.to_string(),
                }
            })
            .collect();

        println!();
        println!("{}", format!("Installed Plugins ({})", rows.len()).bold().green());
        println!();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    if !report.failures.is_empty() {
        println!();
        println!("{}", format!("Failed to load ({})", report.failures.len()).bold().red());
        for (key, failure) in &report.failures {
            println!("  ✗ {} {}", key, failure.path.display().to_string().bright_black());
            println!("    {}", failure.error);
        }
    }

    if !report.conflicts.is_empty() {
        println!();
        println!("{}", "Identifier conflicts".bold().yellow());
        for conflict in &report.conflicts {
            println!("  ⚠ {} kept {}", conflict.id, conflict.kept.display());
            println!("    ignored {}", conflict.rejected.display().to_string().bright_black());
        }
    }

    Ok(())
}
