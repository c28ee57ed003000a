//! Automation module runtime and hot-reload lifecycle
//!
//! This crate provides the three pieces that turn the broker into a usable
//! automation host:
//!
//! - [`ModuleRuntime`]: the base every automation module builds on. It wraps
//!   the broker's subscription calls with tracked variants, provides
//!   timeout/interval/run-at/each-minute scheduling with tracked handles,
//!   and guarantees that `destroy` releases everything exactly once.
//! - [`AutomationModule`] and [`ModuleRegistry`]: the contract a module
//!   implements and the path-keyed factory registry that stands in for
//!   dynamic code loading.
//! - [`LifecycleManager`]: discovers eligible module files under one
//!   directory tree, watches it recursively, and performs atomic
//!   unload-then-reload on change.

mod error;
mod manager;
mod module;
mod runtime;
mod watcher;

pub use error::{ModuleError, ModuleResult};
pub use manager::LifecycleManager;
pub use module::{AutomationModule, ModuleFactory, ModuleRegistry};
pub use runtime::{Clock, ModuleRuntime, TaskId, TimerId};
pub use watcher::{WatchEvent, WatchKind};
