//! `install`, `update`, `outdated` and `uninstall` commands.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled, settings::Style};
use tibok_core::plugins::{DownloadStatus, Downloader, PluginError, UpdateOutcome};
use tokio::task::JoinHandle;

use super::system::Session;
use crate::config::ConfigOverrides;

/// Install a plugin from the catalog.
pub async fn install(overrides: &ConfigOverrides, id: &str, yes: bool) -> anyhow::Result<()> {
    let session = Session::open(overrides, yes).await?;
    let installer = session.system.installer();

    println!("{}", format!("Installing {}...", id).yellow());
    let tracker = track_download(session.system.downloader(), id);
    let result = installer.install_by_id(id).await;
    tracker.abort();

    match result {
        Ok(record) => {
            let version = session
                .system
                .discovery()
                .get(id)
                .map(|p| p.manifest.version)
                .unwrap_or_default();
            println!("{}", format!("✓ Installed {} {}", id, version).green());
            if !record.is_enabled() {
                println!("  Enable it with: tibok-ext enable {}", id);
            }
            Ok(())
        }
        Err(e) => Err(report_failure("Installation", id, e)),
    }
}

/// Update an installed plugin to the catalog version.
pub async fn update(overrides: &ConfigOverrides, id: &str, yes: bool) -> anyhow::Result<()> {
    let session = Session::open(overrides, yes).await?;

    let tracker = track_download(session.system.downloader(), id);
    let result = session.system.installer().update(id).await;
    tracker.abort();

    match result {
        Ok(UpdateOutcome::UpToDate { version }) => {
            println!("{}", format!("{} is up to date ({})", id, version).green());
            Ok(())
        }
        Ok(UpdateOutcome::Updated { from, to }) => {
            println!("{}", format!("✓ Updated {} {} → {}", id, from, to).green());
            Ok(())
        }
        Err(e) => Err(report_failure("Update", id, e)),
    }
}

#[derive(Tabled)]
struct OutdatedRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Installed")]
    installed: String,
    #[tabled(rename = "Available")]
    available: String,
}

/// List installed plugins with a newer catalog version.
pub async fn outdated(overrides: &ConfigOverrides) -> anyhow::Result<()> {
    let session = Session::open(overrides, false).await?;
    let outdated = session.system.installer().outdated().await?;

    if outdated.is_empty() {
        println!("{}", "All plugins are up to date.".green());
        return Ok(());
    }

    let rows: Vec<OutdatedRow> = outdated
        .into_iter()
        .map(|o| OutdatedRow { id: o.id, installed: o.installed, available: o.available })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    println!();
    println!("{}", "Run 'tibok-ext update <id>' to update.".dimmed());
    Ok(())
}

/// Remove an installed plugin.
pub async fn uninstall(overrides: &ConfigOverrides, id: &str) -> anyhow::Result<()> {
    let session = Session::open(overrides, false).await?;
    match session.system.installer().uninstall(id).await {
        Ok(()) => {
            println!("{}", format!("✓ Uninstalled {}", id).green());
            Ok(())
        }
        Err(e) => Err(report_failure("Uninstall", id, e)),
    }
}

/// Prints what went wrong and how to proceed, then returns the error.
fn report_failure(action: &str, id: &str, error: PluginError) -> anyhow::Error {
    println!("{}", format!("✗ {} of {} failed: {}", action, id, error).red());
    let hint = match &error {
        PluginError::PermissionDenied(_) => Some("The requested capabilities were not approved."),
        PluginError::NotFound(_) => Some("Use 'tibok-ext search' or 'tibok-ext list' to find plugin identifiers."),
        PluginError::NotRemovable(_) => Some("Built-in plugins can be disabled but not removed."),
        PluginError::DuplicateIdentifier(_) => Some("Use 'tibok-ext update' to change an installed plugin."),
        e if e.is_retryable() => Some("This may be temporary; try again later."),
        _ => None,
    };
    if let Some(hint) = hint {
        println!("  {}", hint.bright_black());
    }
    anyhow::Error::new(error).context(format!("{} failed", action))
}

/// Shows a progress bar for the plugin's download task once it starts.
fn track_download(downloader: &Arc<Downloader>, id: &str) -> JoinHandle<()> {
    let downloader = Arc::clone(downloader);
    let id = id.to_string();

    tokio::spawn(async move {
        let task = loop {
            if let Some(task) = downloader.task(&id) {
                break task;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        let bar = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.cyan} [{bar:30.cyan/blue}] {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.enable_steady_tick(Duration::from_millis(100));

        let mut progress = task.subscribe();
        loop {
            let current = progress.borrow_and_update().clone();
            bar.set_position((current.fraction * 100.0).round() as u64);
            bar.set_message(match current.status {
                DownloadStatus::Downloading => "downloading",
                DownloadStatus::Verifying => "verifying",
                DownloadStatus::Installing => "installing",
                DownloadStatus::Completed => "done",
                DownloadStatus::Failed => "failed",
            });
            if current.status.is_terminal() || progress.changed().await.is_err() {
                break;
            }
        }
        bar.finish_and_clear();
    })
}
