//! Unified error type for the plugin subsystem.

use thiserror::Error;

use super::manifest::ManifestError;
use super::signing::SigningError;

/// Errors produced by plugin discovery, installation and lifecycle operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Manifest failed to parse or validate.
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    /// Another manifest already claims this identifier.
    #[error("duplicate plugin identifier: {0}")]
    DuplicateIdentifier(String),

    /// The user declined (or dismissed) the capability approval.
    #[error("permission denied for plugin '{0}'")]
    PermissionDenied(String),

    /// The remote catalog could not be fetched or was malformed.
    #[error("plugin registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Fetching the package failed.
    #[error("download failed for '{id}': {reason}")]
    DownloadFailed { id: String, reason: String },

    /// Checksum or signature check failed.
    #[error("verification failed for '{id}': {reason}")]
    VerificationFailed { id: String, reason: String },

    /// Extracting or placing the package failed.
    #[error("installation failed for '{id}': {reason}")]
    InstallFailed { id: String, reason: String },

    /// The plugin is bundled with the host and cannot be uninstalled.
    #[error("plugin '{0}' cannot be removed")]
    NotRemovable(String),

    /// The plugin needs a newer host.
    #[error("plugin '{id}' requires host version {required} (running {host})")]
    HostVersionIncompatible { id: String, required: String, host: String },

    /// No plugin with this identifier is known.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// The download task was cancelled before it completed.
    #[error("download cancelled for '{0}'")]
    Cancelled(String),

    /// The persisted lifecycle store could not be read or written.
    #[error("lifecycle store error: {0}")]
    Store(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RegistryUnavailable(_) | Self::DownloadFailed { .. })
    }
}

impl From<ManifestError> for PluginError {
    fn from(err: ManifestError) -> Self {
        Self::ManifestInvalid(err.to_string())
    }
}

impl From<SigningError> for PluginError {
    fn from(err: SigningError) -> Self {
        Self::VerificationFailed { id: String::new(), reason: err.to_string() }
    }
}

/// Result type for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;
