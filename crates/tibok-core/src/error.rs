//! Error types for tibok Core.

use thiserror::Error;

use crate::config::ConfigError;
use crate::plugins::PluginError;

/// Core error type for tibok operations.
#[derive(Error, Debug)]
pub enum TibokError {
    /// Plugin subsystem errors
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tibok operations.
pub type Result<T> = std::result::Result<T, TibokError>;
