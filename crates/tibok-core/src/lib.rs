//! tibok Core - plugin trust and lifecycle system.
//!
//! This crate provides:
//! - Plugin manifests, capabilities and trust tiers
//! - Discovery, catalog access, downloads and installation
//! - Capability approval and lifecycle bookkeeping
//! - Configuration and error handling
//!
//! # Example
//!
//! ```rust,no_run
//! use tibok_core::{PluginConfig, PluginSystem};
//!
//! #[tokio::main]
//! async fn main() -> tibok_core::Result<()> {
//!     let config = PluginConfig::discover_and_load()?;
//!     let (system, _approvals) = PluginSystem::new(config)?;
//!     let report = system.start().await?;
//!     println!("{} plugins", report.plugins.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod plugins;

pub use config::{ConfigError, PluginConfig};
pub use error::{Result, TibokError};
pub use plugins::{PluginError, PluginSystem};
