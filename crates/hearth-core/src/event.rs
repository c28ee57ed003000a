//! Inbound events delivered by the hub connection
//!
//! The transport layer translates the hub's event stream into `HubEvent`
//! values. Unrecognized event kinds are filtered by the transport and never
//! reach the core.

use serde::{Deserialize, Serialize};

use crate::EntityState;

/// An event delivered to the broker by the connection
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// The connection is established and the event stream is live
    Ready,

    /// The connection closed; modules must be unloaded
    Closed,

    /// An entity's state changed
    StateChanged(StateChangedPayload),

    /// An automation fired on the hub
    AutomationTriggered(AutomationTriggeredPayload),
}

/// Payload of a `state_changed` domain event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedPayload {
    /// The entity that changed
    pub entity_id: String,

    /// The new state, or None when the entity was removed
    pub new_state: Option<EntityState>,

    /// The previous state, or None when the entity was first seen
    pub old_state: Option<EntityState>,
}

/// Payload of an `automation_triggered` domain event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationTriggeredPayload {
    /// The automation entity that fired
    pub entity_id: String,

    /// The automation's friendly name
    pub name: String,
}
