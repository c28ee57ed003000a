//! The automation module contract and factory registry
//!
//! Hot reload is modeled as an explicit registry keyed by source path: each
//! eligible file under the modules root maps to a factory that builds a
//! fresh instance. Reload drops the old instance and re-resolves the
//! factory; a destroyed instance is never resurrected.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::ModuleRuntime;

/// The contract every automation module satisfies
///
/// A module bundles its own subscriptions and scheduled work by registering
/// them through the [`ModuleRuntime`] it is handed at setup. Everything it
/// registers is released when the lifecycle manager destroys the runtime.
pub trait AutomationModule: Send + Sync {
    /// Human-readable title used in logs
    fn title(&self) -> &str {
        "automation"
    }

    /// Register this module's subscriptions and scheduled work
    fn setup(&self, runtime: &ModuleRuntime) -> anyhow::Result<()>;
}

/// Factory producing a fresh module instance
pub type ModuleFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn AutomationModule>> + Send + Sync>;

/// Path-keyed registry of module factories
///
/// Keys are paths relative to the modules root, matching the source file
/// the factory's module belongs to.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: DashMap<PathBuf, ModuleFactory>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a module source file
    pub fn register<F>(&self, path: impl Into<PathBuf>, factory: F)
    where
        F: Fn() -> anyhow::Result<Box<dyn AutomationModule>> + Send + Sync + 'static,
    {
        self.factories.insert(path.into(), Arc::new(factory));
    }

    /// Resolve the factory for a source file, if one is registered
    pub fn resolve(&self, path: &Path) -> Option<ModuleFactory> {
        self.factories.get(path).map(|f| Arc::clone(f.value()))
    }

    /// Number of registered factories
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no factories are registered
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
