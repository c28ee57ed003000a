//! Module lifecycle management
//!
//! The LifecycleManager discovers eligible automation module files under a
//! single directory tree, instantiates them through the factory registry,
//! watches the tree for add/change/remove, and performs atomic
//! unload-then-reload: the old instance's subscriptions and timers are
//! fully released before the new instance registers its own, so an event at
//! the reload boundary reaches exactly one of the two instances.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use hearth_broker::{ModuleHost, SharedBroker};
use hearth_core::ModulesConfig;
use notify::RecommendedWatcher;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::watcher::{self, WatchEvent, WatchKind};
use crate::{AutomationModule, ModuleError, ModuleRegistry, ModuleResult, ModuleRuntime};

struct LoadedModule {
    module: Box<dyn AutomationModule>,
    runtime: ModuleRuntime,
}

struct ManagerInner {
    broker: SharedBroker,
    registry: Arc<ModuleRegistry>,
    config: ModulesConfig,
    /// Canonicalized modules root
    root: PathBuf,
    /// Live instances keyed by path relative to the root; never more than
    /// one per path
    loaded: DashMap<PathBuf, LoadedModule>,
    /// Serializes unload/reload so destroy and construct never overlap
    reload_lock: Mutex<()>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

/// Discovers, loads, watches, and reloads automation modules
///
/// Cheaply cloneable handle around shared state; the watcher task holds a
/// clone of the same manager.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<ManagerInner>,
}

impl LifecycleManager {
    /// Create a manager over the given broker, registry, and configuration
    ///
    /// Fails if the configured modules root does not resolve.
    pub fn new(
        broker: SharedBroker,
        registry: Arc<ModuleRegistry>,
        config: ModulesConfig,
    ) -> ModuleResult<Self> {
        let root = config.root.canonicalize().map_err(|source| ModuleError::Root {
            path: config.root.clone(),
            source,
        })?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                broker,
                registry,
                config,
                root,
                loaded: DashMap::new(),
                reload_lock: Mutex::new(()),
                watcher: Mutex::new(None),
            }),
        })
    }

    /// Load every eligible module file and start watching the tree
    ///
    /// Idempotent: already-loaded modules stay untouched and the watcher is
    /// started at most once, so this is safe to run again on reconnect.
    pub async fn bootstrap(&self) -> ModuleResult<()> {
        info!(root = %self.inner.root.display(), "loading automation modules");
        self.load_existing().await;
        self.start_watcher().await
    }

    /// Unload every loaded module; afterwards the registry of live
    /// instances is empty
    pub async fn shutdown(&self) {
        // Snapshot under the reload lock, so a reload in flight at close
        // time lands in the snapshot instead of surviving it
        let _guard = self.inner.reload_lock.lock().await;
        let paths: Vec<PathBuf> = self.inner.loaded.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            self.unload(&path).await;
        }
    }

    /// Number of live module instances
    pub fn loaded_count(&self) -> usize {
        self.inner.loaded.len()
    }

    /// Whether a live instance exists for a root-relative path
    pub fn is_loaded(&self, path: &Path) -> bool {
        self.inner.loaded.contains_key(path)
    }

    /// Whether a file may be loaded as an automation module
    ///
    /// Eligible files carry the configured module extension and are not
    /// located under a reserved library directory (a path segment equal to
    /// a reserved name or its hidden-dot-prefixed form).
    pub fn is_eligible(&self, path: &Path) -> bool {
        let config = &self.inner.config;
        let has_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == config.extension);
        if !has_extension {
            return false;
        }
        let relative = path.strip_prefix(&self.inner.root).unwrap_or(path);
        !relative
            .parent()
            .into_iter()
            .flat_map(|parent| parent.components())
            .any(|component| match component {
                Component::Normal(segment) => segment.to_str().is_some_and(|segment| {
                    config.reserved_dirs.iter().any(|reserved| {
                        segment == reserved.as_str()
                            || segment.strip_prefix('.').is_some_and(|s| s == reserved.as_str())
                    })
                }),
                _ => false,
            })
    }

    /// React to a filesystem event for a path under the modules root
    ///
    /// Add and change both run the full reload sequence: destroy the old
    /// instance (if any), then instantiate fresh. Remove only unloads.
    pub async fn handle_watch_event(&self, event: WatchEvent) {
        if !self.is_eligible(&event.path) {
            return;
        }
        let relative = self.relative(&event.path);
        debug!(path = %relative.display(), kind = ?event.kind, "module file event");

        // One reload at a time; the old instance is fully destroyed before
        // the replacement registers anything
        let _guard = self.inner.reload_lock.lock().await;
        match event.kind {
            WatchKind::Added | WatchKind::Changed => {
                self.unload(&relative).await;
                self.load(&event.path).await;
            }
            WatchKind::Removed => self.unload(&relative).await,
        }
    }

    async fn load_existing(&self) {
        let _guard = self.inner.reload_lock.lock().await;
        for entry in WalkDir::new(&self.inner.root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%err, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if !self.is_eligible(&path) || self.inner.loaded.contains_key(&self.relative(&path)) {
                continue;
            }
            self.load(&path).await;
        }
    }

    async fn start_watcher(&self) -> ModuleResult<()> {
        let mut slot = self.inner.watcher.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let (watcher, mut events) = watcher::watch(&self.inner.root)?;
        *slot = Some(watcher);

        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_watch_event(event).await;
            }
            debug!("module watcher channel closed");
        });
        Ok(())
    }

    /// Instantiate the module registered for a file
    ///
    /// A failing factory or setup is reported and leaves no instance
    /// registered for the path; the manager keeps operating normally.
    async fn load(&self, path: &Path) {
        let relative = self.relative(path);
        let Some(factory) = self.inner.registry.resolve(&relative) else {
            debug!(path = %relative.display(), "no module registered for file");
            return;
        };
        let module = match factory() {
            Ok(module) => module,
            Err(err) => {
                error!(path = %relative.display(), %err, "module construction failed");
                return;
            }
        };
        let runtime = ModuleRuntime::new(module.title(), Arc::clone(&self.inner.broker));
        if let Err(err) = module.setup(&runtime) {
            error!(module = %module.title(), path = %relative.display(), %err, "module setup failed");
            runtime.destroy().await;
            return;
        }
        info!(module = %module.title(), path = %relative.display(), "module registered");
        self.inner.loaded.insert(relative, LoadedModule { module, runtime });
    }

    /// Destroy and forget the instance for a root-relative path, if any
    async fn unload(&self, relative: &Path) {
        if let Some((_, loaded)) = self.inner.loaded.remove(relative) {
            info!(module = %loaded.module.title(), path = %relative.display(), "unloading module");
            loaded.runtime.destroy().await;
        }
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.inner.root)
            .unwrap_or(path)
            .to_path_buf()
    }
}

#[async_trait]
impl ModuleHost for LifecycleManager {
    async fn load_all(&self) -> anyhow::Result<()> {
        self.bootstrap().await?;
        Ok(())
    }

    async fn unload_all(&self) {
        self.shutdown().await;
    }
}
