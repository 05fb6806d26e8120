//! Plugin trust and lifecycle system.
//!
//! Discovers plugin packages, resolves their trust tier and capabilities,
//! gates elevated access on user approval, installs and updates packages
//! from the remote catalog and owns the enabled state of every plugin.
//!
//! # Example
//!
//! ```rust,no_run
//! use tibok_core::config::PluginConfig;
//! use tibok_core::plugins::PluginSystem;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (system, mut approvals) = PluginSystem::new(PluginConfig::discover_and_load()?)?;
//! tokio::spawn(async move {
//!     while let Some(request) = approvals.next().await {
//!         request.deny();
//!     }
//! });
//!
//! system.start().await?;
//! let record = system.installer().install_by_id("com.example.tables").await?;
//! println!("{} is {:?}", record.id, record.state);
//! # Ok(())
//! # }
//! ```

pub mod approval;
pub mod capability;
pub mod contributions;
pub mod discovery;
pub mod downloader;
pub mod error;
pub mod host;
pub mod installer;
pub mod lifecycle;
pub mod manifest;
pub mod package;
pub mod registry;
pub mod signing;
pub mod versioning;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalInbox, ApprovalRequest, approval_channel};
pub use capability::{
    Capability, ManifestOrigin, RiskLevel, TrustAssessment, TrustContext, TrustTier, requires_approval,
    resolve_tier,
};
pub use contributions::{Contribution, ContributionKind, ContributionRegistry};
pub use discovery::{
    DiscoveredPlugin, DiscoveryOptions, DiscoveryReport, DiscoveryService, DuplicateConflict, SearchLocation,
};
pub use downloader::{
    DownloadProgress, DownloadStatus, DownloadTask, Downloader, DownloaderOptions, FetchError, HttpFetcher,
    InstalledPackage, PackageFetcher,
};
pub use error::{PluginError, Result};
pub use host::{PluginSystem, PluginSystemBuilder};
pub use installer::{Installer, OutdatedPlugin, UpdateOutcome};
pub use lifecycle::{
    JsonFileStore, LifecycleManager, LifecycleObserver, LifecycleRecord, LifecycleStore, MemoryStore,
    ObserverId, PluginState, StoredPluginState,
};
pub use manifest::{MANIFEST_FILE, ManifestError, PluginKind, PluginManifest};
pub use registry::{
    CatalogDocument, CatalogEntry, CatalogFilter, CatalogSnapshot, CatalogSource, FileCatalogSource,
    HttpCatalogSource, RegistryClient, has_update,
};
pub use signing::{PackageSigner, SigningError, TrustedKeys};
pub use versioning::compare_versions;
