//! Error types for module loading and watching

use std::path::PathBuf;

use thiserror::Error;

/// Result type for module lifecycle operations
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Errors that can occur in the module lifecycle
#[derive(Debug, Error)]
pub enum ModuleError {
    /// The configured modules root does not resolve
    #[error("modules root not found at {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The filesystem watcher failed
    #[error("module watcher error: {0}")]
    Watch(#[from] notify::Error),
}
