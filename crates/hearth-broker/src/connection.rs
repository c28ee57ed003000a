//! The connection seam to the hub
//!
//! Handshake, reconnect policy, and message framing live outside the core.
//! The broker only needs the three outbound calls below; inbound events
//! arrive separately as a `HubEvent` stream.

use async_trait::async_trait;
use hearth_core::EntityState;
use thiserror::Error;

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors surfaced by the connection collaborator
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Transport-level failure (socket, framing, timeout)
    #[error("transport error: {0}")]
    Transport(String),

    /// The hub answered with a non-success response
    #[error("request failed with status {status}: {reason}")]
    Http { status: u16, reason: String },

    /// The connection is closed
    #[error("connection closed")]
    Closed,
}

/// Outbound calls the broker makes against the hub
#[async_trait]
pub trait Connection: Send + Sync {
    /// Fetch the full current state list
    async fn get_states(&self) -> ConnectionResult<Vec<EntityState>>;

    /// Call a service in a domain with the given options object
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        options: serde_json::Value,
    ) -> ConnectionResult<serde_json::Value>;

    /// Mutate an entity's state via the hub's HTTP-style endpoint
    async fn set_state(
        &self,
        entity_id: &str,
        body: serde_json::Value,
    ) -> ConnectionResult<serde_json::Value>;
}
