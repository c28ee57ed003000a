//! Error types for broker operations

use thiserror::Error;

use crate::ConnectionError;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur in broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The entity has never been observed in the state cache
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// An entity search pattern failed to compile
    #[error("invalid search pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The underlying connection failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
