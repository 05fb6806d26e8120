//! Package downloader.
//!
//! One [`DownloadTask`] per plugin identifier moves a catalog entry through
//! `downloading → verifying → installing → completed` (or `failed`). Starting
//! a download for an identifier that already has a live task returns that
//! task. Everything before the final rename happens inside a private staging
//! directory under the plugins root, so a failed, cancelled or interrupted
//! task never leaves a package where discovery can see it.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use super::error::{PluginError, Result};
use super::manifest::{MANIFEST_FILE, PluginManifest};
use super::package::{
    InstallReceipt, PackageError, extract_archive, locate_package_root, sha256_hex, verify_checksum,
};
use super::registry::CatalogEntry;
use super::signing::{PackageSigner, TrustedKeys};
use super::versioning::compare_versions;

/// Name of the staging directory inside the plugins root.
pub const STAGING_DIR: &str = ".staging";

const DOWNLOAD_SHARE: f64 = 0.8;
const INSTALL_START: f64 = 0.9;

/// Stage of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    Downloading,
    Verifying,
    Installing,
    Completed,
    Failed,
}

impl DownloadStatus {
    /// Whether the task has finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Which stage a task failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Download,
    Verification,
    Installation,
    Cancelled,
}

/// Retained cause of a failed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    /// Stage that failed.
    pub stage: FailureStage,
    pub reason: String,
}

impl TaskError {
    fn new(stage: FailureStage, reason: impl ToString) -> Self {
        Self { stage, reason: reason.to_string() }
    }

    /// Maps the failure to the plugin error for its stage.
    pub fn to_plugin_error(&self, id: &str) -> PluginError {
        let id = id.to_string();
        let reason = self.reason.clone();
        match self.stage {
            FailureStage::Download => PluginError::DownloadFailed { id, reason },
            FailureStage::Verification => PluginError::VerificationFailed { id, reason },
            FailureStage::Installation => PluginError::InstallFailed { id, reason },
            FailureStage::Cancelled => PluginError::Cancelled(id),
        }
    }
}

/// Observable state of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    /// Current stage.
    pub status: DownloadStatus,
    /// Overall completion in `[0, 1]`.
    pub fraction: f64,
    /// Set once the task failed.
    pub error: Option<TaskError>,
}

/// A package placed into the plugins directory.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledPackage {
    pub manifest: PluginManifest,
    pub path: PathBuf,
    pub receipt: InstallReceipt,
}

/// Tracked unit of work for one plugin.
#[derive(Debug)]
pub struct DownloadTask {
    id: String,
    state: watch::Sender<DownloadProgress>,
    history: Mutex<Vec<DownloadStatus>>,
    outcome: Mutex<Option<std::result::Result<InstalledPackage, TaskError>>>,
    cancelled: AtomicBool,
}

impl DownloadTask {
    fn new(id: &str) -> Self {
        let (state, _) = watch::channel(DownloadProgress {
            status: DownloadStatus::Downloading,
            fraction: 0.0,
            error: None,
        });
        Self {
            id: id.to_string(),
            state,
            history: Mutex::new(vec![DownloadStatus::Downloading]),
            outcome: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Plugin identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> DownloadProgress {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.borrow().status
    }

    /// Receiver for progress updates. Intermediate values may be coalesced.
    pub fn subscribe(&self) -> watch::Receiver<DownloadProgress> {
        self.state.subscribe()
    }

    /// Every status the task has entered, in order.
    pub fn history(&self) -> Vec<DownloadStatus> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Requests cancellation. Honoured at the next stage boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Waits for the task to finish.
    pub async fn wait(&self) -> Result<InstalledPackage> {
        let mut receiver = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = receiver.wait_for(|p| p.status.is_terminal()).await;

        match self.outcome.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(Ok(installed)) => Ok(installed.clone()),
            Some(Err(error)) => Err(error.to_plugin_error(&self.id)),
            None => Err(PluginError::InstallFailed {
                id: self.id.clone(),
                reason: "task ended without an outcome".to_string(),
            }),
        }
    }

    fn checkpoint(&self) -> std::result::Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::new(FailureStage::Cancelled, "cancelled"))
        } else {
            Ok(())
        }
    }

    fn enter(&self, status: DownloadStatus, fraction: f64) {
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.last() != Some(&status) {
                history.push(status);
            }
        }
        self.state.send_modify(|p| {
            p.status = status;
            p.fraction = fraction.clamp(0.0, 1.0);
        });
        debug!(plugin = %self.id, ?status, "Download task stage");
    }

    fn set_fraction(&self, fraction: f64) {
        self.state.send_modify(|p| p.fraction = fraction.clamp(0.0, 1.0));
    }

    fn finish(&self, outcome: std::result::Result<InstalledPackage, TaskError>) {
        let (status, error) = match &outcome {
            Ok(_) => (DownloadStatus::Completed, None),
            Err(e) => (DownloadStatus::Failed, Some(e.clone())),
        };
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.history.lock().unwrap_or_else(PoisonError::into_inner).push(status);
        self.state.send_modify(|p| {
            p.status = status;
            if error.is_none() {
                p.fraction = 1.0;
            }
            p.error = error;
        });
        debug!(plugin = %self.id, ?status, "Download task finished");
    }
}

/// Errors from fetching package bytes.
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status code.
    #[error("server returned status {0}")]
    Status(u16),

    /// I/O error writing the package.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fetches package archives to a local file.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Writes the resource at `url` to `dest`, reporting `(bytes_done, total)`.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> std::result::Result<u64, FetchError>;
}

/// Streams packages over HTTP(S). `file://` URLs are copied from disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("tibok/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PluginError::DownloadFailed { id: String::new(), reason: e.to_string() })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PackageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> std::result::Result<u64, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            let copied = tokio::fs::copy(path, dest).await?;
            progress(copied, Some(copied));
            return Ok(copied);
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut done = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            done += chunk.len() as u64;
            progress(done, total);
        }
        file.flush().await?;

        Ok(done)
    }
}

/// Downloader configuration.
#[derive(Debug, Clone)]
pub struct DownloaderOptions {
    /// Root that receives installed plugin directories.
    pub plugins_dir: PathBuf,
    /// Upper bound on tasks transferring at the same time.
    pub max_concurrent: usize,
}

/// Deduplicating, concurrent package downloader.
pub struct Downloader {
    fetcher: Arc<dyn PackageFetcher>,
    trusted_keys: Arc<TrustedKeys>,
    receipt_signer: Arc<PackageSigner>,
    plugins_dir: PathBuf,
    live: Arc<Mutex<HashMap<String, Arc<DownloadTask>>>>,
    permits: Arc<Semaphore>,
}

impl Downloader {
    /// `receipt_signer` is the host install key that signs install receipts.
    pub fn new(
        options: DownloaderOptions,
        fetcher: Arc<dyn PackageFetcher>,
        trusted_keys: Arc<TrustedKeys>,
        receipt_signer: Arc<PackageSigner>,
    ) -> Self {
        Self {
            fetcher,
            trusted_keys,
            receipt_signer,
            plugins_dir: options.plugins_dir,
            live: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(options.max_concurrent.max(1))),
        }
    }

    /// Directory partial downloads are staged in.
    pub fn staging_dir(&self) -> PathBuf {
        self.plugins_dir.join(STAGING_DIR)
    }

    /// Starts a download, or returns the live task for the same identifier.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, entry: &CatalogEntry) -> Arc<DownloadTask> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = live.get(&entry.id) {
            debug!(plugin = %entry.id, "Attaching to live download task");
            return Arc::clone(task);
        }

        let task = Arc::new(DownloadTask::new(&entry.id));
        live.insert(entry.id.clone(), Arc::clone(&task));
        drop(live);

        let job = Job {
            entry: entry.clone(),
            fetcher: Arc::clone(&self.fetcher),
            trusted_keys: Arc::clone(&self.trusted_keys),
            receipt_signer: Arc::clone(&self.receipt_signer),
            plugins_dir: self.plugins_dir.clone(),
            live: Arc::clone(&self.live),
            permits: Arc::clone(&self.permits),
        };
        info!(plugin = %entry.id, version = %entry.version, "Starting plugin download");
        tokio::spawn(job.run(Arc::clone(&task)));

        task
    }

    /// The live task for an identifier, if any.
    pub fn task(&self, id: &str) -> Option<Arc<DownloadTask>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Number of tasks still running.
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Cancels the live task for an identifier. Returns false if there is none.
    pub fn cancel(&self, id: &str) -> bool {
        match self.task(id) {
            Some(task) => {
                task.cancel();
                info!(plugin = %id, "Download cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Removes staging leftovers of interrupted runs. Skipped while tasks are live.
    pub async fn purge_staging(&self) -> Result<()> {
        if self.live_count() > 0 {
            return Ok(());
        }
        let staging = self.staging_dir();
        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            debug!(path = %staging.display(), "Purging plugin staging directory");
            tokio::fs::remove_dir_all(&staging).await?;
        }
        Ok(())
    }
}

struct Job {
    entry: CatalogEntry,
    fetcher: Arc<dyn PackageFetcher>,
    trusted_keys: Arc<TrustedKeys>,
    receipt_signer: Arc<PackageSigner>,
    plugins_dir: PathBuf,
    live: Arc<Mutex<HashMap<String, Arc<DownloadTask>>>>,
    permits: Arc<Semaphore>,
}

impl Job {
    async fn run(self, task: Arc<DownloadTask>) {
        let outcome = self.execute(&task).await;
        match &outcome {
            Ok(installed) => {
                info!(plugin = %self.entry.id, path = %installed.path.display(), "Plugin package installed");
            }
            Err(e) => warn!(plugin = %self.entry.id, stage = ?e.stage, reason = %e.reason, "Plugin download failed"),
        }

        {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            if live.get(&self.entry.id).is_some_and(|t| Arc::ptr_eq(t, &task)) {
                live.remove(&self.entry.id);
            }
        }
        task.finish(outcome);
    }

    async fn execute(&self, task: &DownloadTask) -> std::result::Result<InstalledPackage, TaskError> {
        let entry = &self.entry;
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TaskError::new(FailureStage::Download, "downloader is shutting down"))?;
        task.checkpoint()?;

        // Downloading.
        let staging_root = self.plugins_dir.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging_root)
            .await
            .map_err(|e| TaskError::new(FailureStage::Download, format!("creating staging directory: {}", e)))?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", entry.id))
            .tempdir_in(&staging_root)
            .map_err(|e| TaskError::new(FailureStage::Download, format!("creating staging directory: {}", e)))?;
        let archive = staging.path().join("package.tar.gz");

        let report = |done: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|t| *t > 0) {
                task.set_fraction(done as f64 / total as f64 * DOWNLOAD_SHARE);
            }
        };
        self.fetcher
            .fetch(&entry.download_url, &archive, &report)
            .await
            .map_err(|e| TaskError::new(FailureStage::Download, e))?;
        task.checkpoint()?;

        // Verifying.
        task.enter(DownloadStatus::Verifying, DOWNLOAD_SHARE);
        let bytes = tokio::fs::read(&archive)
            .await
            .map_err(|e| TaskError::new(FailureStage::Verification, e))?;
        let digest = verify_package(entry, &bytes, &self.trusted_keys)?;
        drop(bytes);
        task.checkpoint()?;

        // Installing.
        task.enter(DownloadStatus::Installing, INSTALL_START);
        let entry = entry.clone();
        let staging_path = staging.path().to_path_buf();
        let final_dir = self.plugins_dir.join(&entry.id);
        let signer = Arc::clone(&self.receipt_signer);
        let installed = tokio::task::spawn_blocking(move || {
            place_package(&entry, &staging_path, &final_dir, digest, &signer)
        })
        .await
        .map_err(|e| TaskError::new(FailureStage::Installation, e))?
        .map_err(|reason| TaskError::new(FailureStage::Installation, reason))?;

        // `staging` is dropped here, removing whatever the rename left behind.
        Ok(installed)
    }
}

/// Checks the package digest and signature. Returns the hex digest.
fn verify_package(
    entry: &CatalogEntry,
    bytes: &[u8],
    trusted_keys: &TrustedKeys,
) -> std::result::Result<String, TaskError> {
    let fail = |reason: String| TaskError::new(FailureStage::Verification, reason);

    if entry.sha256.is_none() && entry.signature.is_none() {
        return Err(fail("catalog entry carries neither a checksum nor a signature".to_string()));
    }
    if let Some(expected) = entry.sha256.as_deref() {
        verify_checksum(bytes, expected).map_err(|e| fail(e.to_string()))?;
    }
    if let Some(signature) = entry.signature.as_deref() {
        let key = trusted_keys.verify(bytes, signature).map_err(|e| fail(e.to_string()))?;
        debug!(plugin = %entry.id, key, "Package signature verified");
    }

    Ok(sha256_hex(bytes))
}

/// Extracts the staged archive, checks it against the entry and renames it into place.
fn place_package(
    entry: &CatalogEntry,
    staging: &Path,
    final_dir: &Path,
    digest: String,
    signer: &PackageSigner,
) -> std::result::Result<InstalledPackage, String> {
    let extract_dir = staging.join("extract");
    extract_archive(&staging.join("package.tar.gz"), &extract_dir).map_err(|e| e.to_string())?;
    let root = locate_package_root(&extract_dir).map_err(|e| e.to_string())?;
    let manifest = PluginManifest::load_from_dir(&root).map_err(|e| format!("packaged manifest: {}", e))?;

    if manifest.id != entry.id {
        return Err(format!("package contains '{}', expected '{}'", manifest.id, entry.id));
    }
    if compare_versions(&manifest.version, &entry.version) != std::cmp::Ordering::Equal {
        return Err(format!(
            "package version {} does not match catalog version {}",
            manifest.version, entry.version
        ));
    }

    let undeclared: Vec<&str> = manifest
        .capabilities
        .iter()
        .filter(|c| !entry.capabilities.contains(c))
        .map(|c| c.token())
        .collect();
    if !undeclared.is_empty() {
        return Err(format!(
            "package requests capabilities the catalog did not list: {}",
            undeclared.join(", ")
        ));
    }

    if final_dir.exists() {
        return Err(format!("{} already exists", final_dir.display()));
    }

    let manifest_bytes =
        std::fs::read(root.join(MANIFEST_FILE)).map_err(|e| format!("packaged manifest: {}", e))?;
    let mut receipt = InstallReceipt::registry(&entry.version, digest, &entry.download_url, &manifest_bytes);
    receipt
        .sign(signer)
        .and_then(|()| receipt.write(&root))
        .map_err(|e: PackageError| e.to_string())?;
    std::fs::rename(&root, final_dir).map_err(|e| format!("moving package into place: {}", e))?;

    Ok(InstalledPackage { manifest, path: final_dir.to_path_buf(), receipt })
}
