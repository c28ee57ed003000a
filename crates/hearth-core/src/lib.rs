//! Core types for the hearth hub runtime
//!
//! This crate provides the fundamental types shared by the broker and the
//! module runtime: EntityState, StatePatch, the inbound HubEvent stream,
//! and runtime configuration.

mod config;
mod event;
mod state;

pub use config::{ConfigError, ConfigResult, ConnectionConfig, ModulesConfig, RuntimeConfig};
pub use event::{AutomationTriggeredPayload, HubEvent, StateChangedPayload};
pub use state::{EntityState, StatePatch};
