//! `search` and `info` commands.

use anyhow::anyhow;
use colored::Colorize;
use tabled::{Table, Tabled, settings::Style};
use tibok_core::plugins::{CatalogFilter, TrustTier};

use super::prompt::risk_label;
use super::system::Session;
use crate::config::ConfigOverrides;

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Downloads")]
    downloads: u64,
    #[tabled(rename = "Installed")]
    installed: String,
}

/// Search the catalog.
pub async fn search(
    overrides: &ConfigOverrides,
    query: &str,
    category: Option<String>,
    tier: Option<&str>,
    refresh: bool,
    json_output: bool,
) -> anyhow::Result<()> {
    let mut filter = CatalogFilter::default();
    if let Some(category) = category {
        filter = filter.category(category);
    }
    if let Some(tier) = tier {
        let tier = TrustTier::parse(tier)
            .ok_or_else(|| anyhow!("Unknown tier '{}'. Use official, verified or community.", tier))?;
        filter = filter.tier(tier);
    }

    let session = Session::open(overrides, false).await?;
    let results = session.system.registry().search(query, &filter, refresh).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("{}", format!("No plugins match '{}'.", query).yellow());
        return Ok(());
    }

    let discovery = session.system.discovery();
    let rows: Vec<EntryRow> = results
        .iter()
        .map(|entry| EntryRow {
            id: entry.id.clone(),
            name: entry.name.clone(),
            version: entry.version.clone(),
            tier: entry.tier().to_string(),
            downloads: entry.downloads,
            installed: discovery.get(&entry.id).map_or_else(|| "-".to_string(), |p| p.manifest.version),
        })
        .collect();

    println!();
    println!("{}", format!("Catalog results ({})", rows.len()).bold().green());
    println!();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

/// Show one catalog entry with the risk of each capability it requests.
pub async fn info(overrides: &ConfigOverrides, id: &str) -> anyhow::Result<()> {
    let session = Session::open(overrides, false).await?;
    let entry = session.system.registry().entry(id).await.map_err(|e| {
        anyhow!("{}. Use 'tibok-ext search' to browse the catalog.", e)
    })?;
    let assessment = entry.assess();

    println!();
    println!("{}", format!("Plugin: {}", entry.name).bold().green());
    println!();
    println!("  ID:          {}", entry.id);
    println!("  Version:     {}", entry.version);
    println!("  Tier:        {}", assessment.tier);
    if !entry.author.is_empty() {
        println!("  Author:      {}", entry.author);
    }
    if !entry.description.is_empty() {
        println!("  Description: {}", entry.description);
    }
    println!("  Requires:    tibok {}", entry.min_host_version);
    if let Some(license) = &entry.license {
        println!("  License:     {}", license);
    }
    if let Some(homepage) = &entry.homepage {
        println!("  Homepage:    {}", homepage);
    }
    if let Some(installed) = session.system.discovery().get(&entry.id) {
        println!("  Installed:   {}", installed.manifest.version);
    }
    println!();

    if assessment.capabilities.is_empty() {
        println!("  Capabilities: {}", "none".bright_black());
    } else {
        println!("  Capabilities:");
        for capability in &assessment.capabilities {
            println!("    • {} [{}]", capability.display_name(), risk_label(capability.risk()));
            println!("      {}", capability.description().bright_black());
        }
    }
    println!();

    if assessment.requires_acknowledgment {
        println!("{}", "⚠ Installing requires acknowledging the risk of an unreviewed plugin.".yellow());
    } else if assessment.requires_approval {
        println!("{}", "Installing asks for your approval of these capabilities.".bright_black());
    }

    Ok(())
}
