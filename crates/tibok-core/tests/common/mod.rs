//! Shared fixtures for tibok-core integration tests.
//!
//! Builders for manifests, packages and catalog entries, plus in-memory
//! catalog and package backends so plugin flows run without a network.

#![allow(dead_code)]

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tibok_core::PluginConfig;
use tibok_core::plugins::approval::ApprovalRequest;
use tibok_core::plugins::downloader::FetchError;
use tibok_core::plugins::package::sha256_hex;
use tibok_core::plugins::{
    ApprovalInbox, CatalogDocument, CatalogEntry, CatalogSource, LifecycleStore, MemoryStore,
    PackageFetcher, PluginSystem, Result, TrustedKeys,
};
use tokio::sync::Notify;

pub const HOST_VERSION: &str = "1.0.0";

/// Routes plugin logs to the test harness. Filter with `RUST_LOG`, e.g.
/// `RUST_LOG=tibok_core=debug`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Manifest JSON with the required fields and the given capabilities.
pub fn manifest_json(id: &str, version: &str, capabilities: &[&str]) -> String {
    manifest_value(id, version, capabilities).to_string()
}

pub fn manifest_value(id: &str, version: &str, capabilities: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": id,
        "version": version,
        "minHostVersion": "0.1",
        "kind": "script",
        "capabilities": capabilities,
    })
}

/// Writes `<root>/<dir_name>/tibok-plugin.json`.
pub fn write_plugin_dir(root: &Path, dir_name: &str, manifest: &str) -> PathBuf {
    let dir = root.join(dir_name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("tibok-plugin.json"), manifest).unwrap();
    dir
}

/// A `.tar.gz` package with the manifest inside a top-level directory.
pub fn package_bytes(manifest: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, content) in [("package/tibok-plugin.json", manifest), ("package/main.lua", "return {}")] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Catalog entry whose checksum matches `package`.
pub fn catalog_entry(
    id: &str,
    version: &str,
    capabilities: &[&str],
    tier: &str,
    package: &[u8],
) -> CatalogEntry {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": id,
        "version": version,
        "description": format!("{id} plugin"),
        "capabilities": capabilities,
        "trustTier": tier,
        "categories": ["writing"],
        "downloadUrl": format!("mem://{id}/{version}.tar.gz"),
        "sha256": sha256_hex(package),
        "minHostVersion": "0.1",
    }))
    .unwrap()
}

/// Catalog source serving a replaceable document.
pub struct StaticSource {
    document: Mutex<CatalogDocument>,
    pub fetches: AtomicUsize,
    pub failing: AtomicBool,
}

impl StaticSource {
    pub fn new(entries: Vec<CatalogEntry>) -> Arc<Self> {
        Arc::new(Self {
            document: Mutex::new(CatalogDocument { extensions: entries, categories: vec!["writing".to_string()] }),
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_entries(&self, entries: Vec<CatalogEntry>) {
        self.document.lock().unwrap().extensions = entries;
    }
}

#[async_trait]
impl CatalogSource for StaticSource {
    async fn fetch(&self) -> Result<CatalogDocument> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(tibok_core::PluginError::RegistryUnavailable("offline".to_string()));
        }
        Ok(self.document.lock().unwrap().clone())
    }
}

/// Package fetcher serving bytes by URL, optionally parked until released.
#[derive(Default)]
pub struct MemoryFetcher {
    packages: Mutex<HashMap<String, Vec<u8>>>,
    pub calls: AtomicUsize,
    gated: AtomicBool,
    gate: Notify,
}

impl MemoryFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, entry: &CatalogEntry, bytes: Vec<u8>) {
        self.packages.lock().unwrap().insert(entry.download_url.clone(), bytes);
    }

    /// Parks every following fetch until [`MemoryFetcher::release`].
    pub fn hold(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
        self.gate.notify_one();
    }
}

#[async_trait]
impl PackageFetcher for MemoryFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> std::result::Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        let bytes = self.packages.lock().unwrap().get(url).cloned().ok_or(FetchError::Status(404))?;
        tokio::fs::write(dest, &bytes).await?;
        let len = bytes.len() as u64;
        progress(len / 2, Some(len));
        progress(len, Some(len));
        Ok(len)
    }
}

/// Config rooted in a temporary directory.
pub fn test_config(root: &Path) -> PluginConfig {
    PluginConfig {
        plugins_dir: root.join("plugins"),
        builtin_dir: Some(root.join("builtin")),
        state_file: root.join("plugin-state.json"),
        trusted_keys_dir: root.join("trusted-keys"),
        registry_url: "mem://catalog".to_string(),
        cache_ttl_secs: None,
        request_timeout_secs: 5,
        max_concurrent_downloads: 2,
        host_version: HOST_VERSION.to_string(),
    }
}

/// A plugin system over in-memory backends.
pub struct TestHost {
    pub temp_dir: TempDir,
    pub system: PluginSystem,
    pub inbox: ApprovalInbox,
    pub source: Arc<StaticSource>,
    pub fetcher: Arc<MemoryFetcher>,
    pub store: Arc<MemoryStore>,
}

impl TestHost {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self::with_keys(entries, TrustedKeys::new())
    }

    pub fn with_keys(entries: Vec<CatalogEntry>, keys: TrustedKeys) -> Self {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let source = StaticSource::new(entries);
        let fetcher = MemoryFetcher::new();
        let store = Arc::new(MemoryStore::new());

        let (system, inbox) = PluginSystem::builder()
            .catalog_source(source.clone())
            .fetcher(fetcher.clone())
            .store(store.clone() as Arc<dyn LifecycleStore>)
            .trusted_keys(keys)
            .build(test_config(temp_dir.path()))
            .unwrap();

        Self { temp_dir, system, inbox, source, fetcher, store }
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.system.config().plugins_dir.clone()
    }

    pub fn builtin_dir(&self) -> PathBuf {
        self.temp_dir.path().join("builtin")
    }

    /// Adds an entry to the catalog and serves its package.
    pub fn publish(&self, entry: &CatalogEntry, package: Vec<u8>) {
        self.fetcher.serve(entry, package);
        let mut entries = self
            .source
            .document
            .lock()
            .unwrap()
            .extensions
            .iter()
            .filter(|e| e.id != entry.id)
            .cloned()
            .collect::<Vec<_>>();
        entries.push(entry.clone());
        self.source.set_entries(entries);
    }

    /// Waits for the next approval request.
    pub async fn next_request(&mut self) -> ApprovalRequest {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.inbox.next())
            .await
            .expect("approval request was not raised")
            .expect("approval channel closed")
    }
}

/// Acknowledges when needed, then approves.
pub fn approve(mut request: ApprovalRequest) {
    if request.requires_acknowledgment() {
        request.acknowledge();
    }
    request.approve().expect("approval accepted");
}
