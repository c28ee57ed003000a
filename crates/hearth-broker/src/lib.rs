//! State cache, listener registries, and event dispatch
//!
//! This crate provides the Broker, the single process-wide component that
//! owns the entity-state cache and the two listener registries, routes
//! inbound hub events to registered listeners, and exposes read/query/mutate
//! operations to automation modules. The wire-level transport is a black box
//! behind the `Connection` trait; module load/unload is signalled through
//! the `ModuleHost` trait.

mod broker;
mod connection;
mod error;

pub use broker::{
    AutomationCallback, Broker, ModuleHost, SharedBroker, StateCallback, SubscriptionId,
};
pub use connection::{Connection, ConnectionError, ConnectionResult};
pub use error::{BrokerError, BrokerResult};
