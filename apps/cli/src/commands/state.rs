//! `enable` and `disable` commands.

use anyhow::Context;
use colored::Colorize;

use super::system::Session;
use crate::config::ConfigOverrides;

/// Enable a plugin, asking for consent if its capabilities were never granted.
pub async fn enable(overrides: &ConfigOverrides, id: &str, yes: bool) -> anyhow::Result<()> {
    let session = Session::open(overrides, yes).await?;
    session
        .system
        .installer()
        .enable(id)
        .await
        .with_context(|| format!("Could not enable {}", id))?;
    println!("{}", format!("✓ Enabled {}", id).green());
    Ok(())
}

/// Disable a plugin. Its files and granted capabilities are kept.
pub async fn disable(overrides: &ConfigOverrides, id: &str) -> anyhow::Result<()> {
    let session = Session::open(overrides, false).await?;
    session.system.installer().disable(id).with_context(|| format!("Could not disable {}", id))?;
    println!("{}", format!("✓ Disabled {}", id).green());
    Ok(())
}
