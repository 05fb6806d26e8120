//! Remote plugin catalog client.
//!
//! Fetches the catalog document, validates it as a whole and caches it as an
//! immutable snapshot. Readers take a read lock only long enough to clone the
//! `Arc` to the current snapshot, and a refresh swaps in a new one once the
//! fetch is done. No lock on the snapshot is held across a fetch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::capability::{
    Capability, ManifestOrigin, TrustAssessment, TrustContext, TrustTier, resolve_tier,
};
use super::error::{PluginError, Result};
use super::manifest::{Contributions, PluginKind, PluginManifest, is_valid_identifier};
use super::versioning::{is_newer, is_valid_version};

fn default_min_host_version() -> String {
    "0".to_string()
}

fn default_kind() -> PluginKind {
    PluginKind::Script
}

/// An installable plugin as listed by the remote catalog. Untrusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    /// Reverse-DNS plugin identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Version the package carries.
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub author: String,
    /// Download count reported by the catalog.
    #[serde(default)]
    pub downloads: u64,
    /// Average rating, if the catalog has one.
    #[serde(default)]
    pub rating: Option<f64>,
    /// Declared capabilities. The package may not ask for more.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Tier claimed by the catalog, capped at `verified` when assessed.
    #[serde(default)]
    pub trust_tier: Option<TrustTier>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Location of the `.tar.gz` package.
    pub download_url: String,
    /// Hex SHA-256 of the package.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Base64 Ed25519 signature over the package bytes.
    #[serde(default)]
    pub signature: Option<String>,
    /// Lowest host version the plugin runs on.
    #[serde(default = "default_min_host_version")]
    pub min_host_version: String,
    #[serde(default = "default_kind")]
    pub kind: PluginKind,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
}

impl CatalogEntry {
    /// Structural checks beyond what deserialization enforces.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !is_valid_identifier(&self.id) {
            return Err(format!("invalid identifier '{}'", self.id));
        }
        if self.name.trim().is_empty() {
            return Err(format!("entry '{}' has an empty name", self.id));
        }
        if !is_valid_version(&self.version) {
            return Err(format!("entry '{}' has invalid version '{}'", self.id, self.version));
        }
        if !is_valid_version(&self.min_host_version) {
            return Err(format!(
                "entry '{}' has invalid minHostVersion '{}'",
                self.id, self.min_host_version
            ));
        }
        if self.download_url.trim().is_empty() {
            return Err(format!("entry '{}' has no downloadUrl", self.id));
        }
        Ok(())
    }

    /// Effective tier of a catalog install. Never `official`.
    pub fn tier(&self) -> TrustTier {
        resolve_tier(self.trust_tier, TrustContext::new(ManifestOrigin::Registry))
    }

    pub fn assess(&self) -> TrustAssessment {
        TrustAssessment::new(
            self.trust_tier,
            &self.capabilities,
            TrustContext::new(ManifestOrigin::Registry),
        )
    }

    /// Manifest as advertised by the catalog, used to present approvals
    /// before the package itself is available.
    pub fn to_manifest(&self) -> PluginManifest {
        PluginManifest {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            icon: self.icon.clone(),
            author: self.author.clone(),
            min_host_version: self.min_host_version.clone(),
            kind: self.kind,
            capabilities: self.capabilities.clone(),
            trust_tier: self.trust_tier,
            signature: None,
            capability_schema: None,
            config_schema: None,
            homepage: self.homepage.clone(),
            repository: self.repository.clone(),
            license: self.license.clone(),
            keywords: self.keywords.clone(),
            contributes: Contributions::default(),
        }
    }
}

/// Wire format of the catalog endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDocument {
    /// Listed plugins.
    pub extensions: Vec<CatalogEntry>,
    /// Category names offered for filtering.
    #[serde(default)]
    pub categories: Vec<String>,
}

impl CatalogDocument {
    /// Parses and validates a catalog. Any deviation rejects the whole document.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let document: Self = serde_json::from_slice(bytes)
            .map_err(|e| PluginError::RegistryUnavailable(format!("malformed catalog: {}", e)))?;
        document.validate()?;
        Ok(document)
    }

    /// Validates every entry and rejects duplicate identifiers.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.extensions {
            entry
                .validate()
                .map_err(|reason| PluginError::RegistryUnavailable(format!("malformed catalog: {}", reason)))?;
            if !seen.insert(entry.id.as_str()) {
                return Err(PluginError::RegistryUnavailable(format!(
                    "malformed catalog: duplicate entry '{}'",
                    entry.id
                )));
            }
        }
        Ok(())
    }
}

/// Pure predicate over catalog entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogFilter {
    /// Keep entries listing this category, compared case-insensitively.
    pub category: Option<String>,
    /// Keep entries whose effective tier is this one.
    pub tier: Option<TrustTier>,
}

impl CatalogFilter {
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn tier(mut self, tier: TrustTier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Whether `entry` passes every configured criterion.
    pub fn matches(&self, entry: &CatalogEntry) -> bool {
        let category_ok = self.category.as_ref().is_none_or(|wanted| {
            entry.categories.iter().any(|c| c.eq_ignore_ascii_case(wanted))
        });
        let tier_ok = self.tier.is_none_or(|wanted| entry.tier() == wanted);
        category_ok && tier_ok
    }
}

/// Immutable view of one successful catalog fetch.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    entries: Vec<CatalogEntry>,
    categories: Vec<String>,
    fetched_at: Instant,
    fetched_at_utc: DateTime<Utc>,
}

impl CatalogSnapshot {
    /// Wraps a validated document, stamped with the current time.
    pub fn new(document: CatalogDocument) -> Self {
        Self {
            entries: document.extensions,
            categories: document.categories,
            fetched_at: Instant::now(),
            fetched_at_utc: Utc::now(),
        }
    }

    /// All entries in catalog order.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Wall-clock time of the fetch.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at_utc
    }

    /// Time since the fetch.
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// Entry by identifier.
    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Case-insensitive search.
    ///
    /// Ranking: exact identifier, then name, then description, keyword or
    /// category matches. Ties keep catalog order. An empty query returns
    /// every entry.
    pub fn search(&self, query: &str) -> Vec<&CatalogEntry> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.entries.iter().collect();
        }

        let mut ranked: Vec<(u8, &CatalogEntry)> =
            self.entries.iter().filter_map(|entry| search_rank(entry, &query).map(|rank| (rank, entry))).collect();
        ranked.sort_by_key(|(rank, _)| *rank);
        ranked.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Entries matching `filter`, in catalog order.
    pub fn filter(&self, filter: &CatalogFilter) -> Vec<&CatalogEntry> {
        self.entries.iter().filter(|e| filter.matches(e)).collect()
    }

    /// Search then filter.
    pub fn query(&self, text: &str, filter: &CatalogFilter) -> Vec<CatalogEntry> {
        self.search(text).into_iter().filter(|e| filter.matches(e)).cloned().collect()
    }
}

fn search_rank(entry: &CatalogEntry, query: &str) -> Option<u8> {
    let contains = |text: &str| text.to_lowercase().contains(query);

    if entry.id.to_lowercase() == query {
        Some(0)
    } else if contains(&entry.name) {
        Some(1)
    } else if contains(&entry.description)
        || entry.keywords.iter().any(|k| contains(k))
        || entry.categories.iter().any(|c| contains(c))
    {
        Some(2)
    } else {
        None
    }
}

/// True when the catalog offers a newer version of an installed plugin.
pub fn has_update(installed: &PluginManifest, entry: &CatalogEntry) -> bool {
    installed.id == entry.id && is_newer(&entry.version, &installed.version)
}

/// Where catalog documents come from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch(&self) -> Result<CatalogDocument>;
}

/// Catalog served over HTTP(S).
pub struct HttpCatalogSource {
    client: reqwest::Client,
    url: String,
    max_retries: u32,
}

impl HttpCatalogSource {
    /// Creates a source for the catalog at `url`.
    ///
    /// # Arguments
    /// * `url` - The catalog endpoint
    /// * `timeout` - Per-request timeout
    ///
    /// # Errors
    /// Returns `RegistryUnavailable` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tibok/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PluginError::RegistryUnavailable(format!("HTTP client: {}", e)))?;
        Ok(Self { client, url: url.into(), max_retries: 2 })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn get_with_retry(&self) -> Result<reqwest::Response> {
        let mut last_error = String::from("no attempt made");

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }

            match self.client.get(&self.url).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status().is_server_error() => {
                    last_error = format!("server returned {}", response.status());
                }
                Ok(response) => {
                    return Err(PluginError::RegistryUnavailable(format!(
                        "catalog request failed with status {}",
                        response.status()
                    )));
                }
                Err(e) => last_error = e.to_string(),
            }
            debug!(url = %self.url, attempt, error = %last_error, "Catalog request failed");
        }

        Err(PluginError::RegistryUnavailable(last_error))
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch(&self) -> Result<CatalogDocument> {
        let response = self.get_with_retry().await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PluginError::RegistryUnavailable(format!("reading catalog: {}", e)))?;
        CatalogDocument::parse(&bytes)
    }
}

/// Catalog read from a local file, for offline mirrors and tests.
pub struct FileCatalogSource {
    path: PathBuf,
}

impl FileCatalogSource {
    /// Source reading the catalog from a local file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Accepts `file://` URLs and plain paths.
    pub fn from_url(url: &str) -> Self {
        Self::new(url.strip_prefix("file://").unwrap_or(url))
    }
}

#[async_trait]
impl CatalogSource for FileCatalogSource {
    async fn fetch(&self) -> Result<CatalogDocument> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            PluginError::RegistryUnavailable(format!("reading {}: {}", self.path.display(), e))
        })?;
        CatalogDocument::parse(&bytes)
    }
}

/// Caching catalog client.
pub struct RegistryClient {
    source: Arc<dyn CatalogSource>,
    /// Written only to swap in a finished snapshot.
    cache: RwLock<Option<Arc<CatalogSnapshot>>>,
    ttl: Option<Duration>,
    refresh: tokio::sync::Mutex<()>,
}

impl RegistryClient {
    /// Creates a client with an empty cache and no TTL.
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self { source, cache: RwLock::new(None), ttl: None, refresh: tokio::sync::Mutex::new(()) }
    }

    /// Treats snapshots older than `ttl` as due for refresh.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// The current snapshot, if any, without fetching.
    ///
    /// Never waits for a refresh in progress.
    pub fn cached(&self) -> Option<Arc<CatalogSnapshot>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn is_fresh(&self, snapshot: &CatalogSnapshot) -> bool {
        self.ttl.is_none_or(|ttl| snapshot.age() < ttl)
    }

    /// Returns the catalog, fetching only when forced or when nothing usable is cached.
    ///
    /// A forced refresh that fails returns `RegistryUnavailable` and leaves
    /// the previous snapshot in place. When an expired snapshot exists and the
    /// background refresh fails, the expired snapshot is returned.
    pub async fn catalog(&self, force_refresh: bool) -> Result<Arc<CatalogSnapshot>> {
        if !force_refresh {
            if let Some(snapshot) = self.cached().filter(|s| self.is_fresh(s)) {
                return Ok(snapshot);
            }
        }

        let _guard = self.refresh.lock().await;

        // Another caller may have refreshed while we waited.
        let cached = self.cached();
        if !force_refresh {
            if let Some(snapshot) = cached.as_ref().filter(|s| self.is_fresh(s)) {
                return Ok(Arc::clone(snapshot));
            }
        }

        match self.source.fetch().await {
            Ok(document) => {
                let snapshot = Arc::new(CatalogSnapshot::new(document));
                info!(entries = snapshot.entries().len(), "Plugin catalog refreshed");
                *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&snapshot));
                Ok(snapshot)
            }
            Err(e) => match cached {
                Some(stale) if !force_refresh => {
                    warn!(error = %e, "Catalog refresh failed, serving cached catalog");
                    Ok(stale)
                }
                _ => Err(e),
            },
        }
    }

    /// Ranked search with filters applied.
    pub async fn search(
        &self,
        query: &str,
        filter: &CatalogFilter,
        force_refresh: bool,
    ) -> Result<Vec<CatalogEntry>> {
        Ok(self.catalog(force_refresh).await?.query(query, filter))
    }

    /// Catalog entry by identifier.
    ///
    /// # Returns
    /// `NotFound` when the catalog has no such entry.
    pub async fn entry(&self, id: &str) -> Result<CatalogEntry> {
        self.catalog(false).await?.get(id).cloned().ok_or_else(|| PluginError::NotFound(id.to_string()))
    }
}
