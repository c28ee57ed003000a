//! The state and listener broker
//!
//! The Broker is constructed once per process and lives until process exit.
//! It owns the entity-state cache and the two listener registries, keeps the
//! cache in sync with the hub, fans inbound events out to listeners, and
//! signals the module host on connection ready/close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use hearth_core::{
    AutomationTriggeredPayload, EntityState, HubEvent, StateChangedPayload, StatePatch,
};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::{BrokerError, BrokerResult, Connection};

/// A unique identifier for a registered listener
///
/// Ids come from a single monotonic counter shared by both registries, so
/// no two listeners ever collide while both remain registered. The default
/// value is the null id, which is never assigned to a live listener.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback invoked with (new state, previous state) on a state change
pub type StateCallback =
    Arc<dyn Fn(EntityState, Option<EntityState>) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync>;

/// Zero-argument callback invoked when an automation fires
pub type AutomationCallback =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct StateListener {
    id: SubscriptionId,
    callback: StateCallback,
}

struct AutomationListener {
    id: SubscriptionId,
    callback: AutomationCallback,
}

/// The module-lifecycle side of the broker's run loop
///
/// Implemented by the lifecycle manager; the broker signals it to load all
/// modules once states are synced and to unload everything on close.
#[async_trait]
pub trait ModuleHost: Send + Sync {
    /// Load every eligible automation module
    async fn load_all(&self) -> anyhow::Result<()>;

    /// Unload every loaded module; failures are isolated and logged
    async fn unload_all(&self);
}

/// The state and listener broker
pub struct Broker {
    connection: Arc<dyn Connection>,
    /// All entity states keyed by entity id
    states: DashMap<String, EntityState>,
    /// State-change listeners keyed by entity id, in registration order
    state_listeners: DashMap<String, Vec<StateListener>>,
    /// Automation-trigger listeners keyed by automation entity id
    automation_listeners: DashMap<String, Vec<AutomationListener>>,
    /// Counter for generating unique subscription ids
    next_subscription_id: AtomicU64,
}

/// Thread-safe wrapper for Broker
pub type SharedBroker = Arc<Broker>;

impl Broker {
    /// Create a broker over the given connection
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            states: DashMap::new(),
            state_listeners: DashMap::new(),
            automation_listeners: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Drive the broker from the inbound event stream
    ///
    /// On `Ready` the cache is synced and the host loads its modules; on
    /// `Closed` the host unloads everything. Domain events are dispatched in
    /// arrival order. Returns when the event stream ends.
    pub async fn run(&self, mut events: mpsc::Receiver<HubEvent>, host: Arc<dyn ModuleHost>) {
        while let Some(event) = events.recv().await {
            match event {
                HubEvent::Ready => {
                    info!("connection ready");
                    match self.sync_states().await {
                        Ok(count) => debug!(entities = count, "state cache synchronized"),
                        Err(err) => {
                            // Modules must not load against an unsynced cache
                            error!(%err, "state sync failed, skipping module load");
                            continue;
                        }
                    }
                    if let Err(err) = host.load_all().await {
                        error!(%err, "module load failed");
                    }
                }
                HubEvent::Closed => {
                    warn!("connection closed, unloading modules");
                    host.unload_all().await;
                }
                HubEvent::StateChanged(payload) => self.dispatch_state_changed(payload).await,
                HubEvent::AutomationTriggered(payload) => {
                    self.dispatch_automation_triggered(payload).await
                }
            }
        }
        debug!("event stream ended");
    }

    /// Fetch the full state list from the hub, replacing the entire cache
    ///
    /// Propagates the fetch failure; the cache is untouched on error.
    pub async fn sync_states(&self) -> BrokerResult<usize> {
        let fetched = self.connection.get_states().await?;
        self.states.clear();
        for state in fetched {
            self.states.insert(state.entity_id.clone(), state);
        }
        Ok(self.states.len())
    }

    /// Get the cached state of an entity
    ///
    /// Fails with `EntityNotFound` if the entity has never been observed.
    /// There is no implicit fetch.
    pub fn get_state(&self, entity_id: &str) -> BrokerResult<EntityState> {
        self.states
            .get(entity_id)
            .map(|s| s.clone())
            .ok_or_else(|| BrokerError::EntityNotFound(entity_id.to_string()))
    }

    /// Get the cached state value, or None if the entity is unknown
    pub fn state_value(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    /// Check if an entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.state_value(entity_id).as_deref() == Some(state)
    }

    /// Get all cached states
    pub fn all_states(&self) -> Vec<EntityState> {
        self.states.iter().map(|s| s.value().clone()).collect()
    }

    /// Number of entities in the cache
    pub fn entity_count(&self) -> usize {
        self.states.len()
    }

    /// Send a state mutation to the hub
    ///
    /// Non-success responses surface as `ConnectionError::Http`. The local
    /// cache is not updated; the next observed event is authoritative.
    pub async fn set_state(
        &self,
        entity_id: &str,
        patch: StatePatch,
    ) -> BrokerResult<serde_json::Value> {
        let result = self.connection.set_state(entity_id, patch.into_body()).await?;
        Ok(result)
    }

    /// Find all cached states whose entity id matches the pattern
    ///
    /// The pattern is compiled as an unanchored regex and matched anywhere
    /// in the entity id. Results are sorted by entity id.
    pub fn search_entities(&self, pattern: &str) -> BrokerResult<Vec<EntityState>> {
        let regex = Regex::new(pattern).map_err(|source| BrokerError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(self.search_entities_regex(&regex))
    }

    /// Find all cached states matching a precompiled pattern
    pub fn search_entities_regex(&self, pattern: &Regex) -> Vec<EntityState> {
        let mut matches: Vec<EntityState> = self
            .states
            .iter()
            .filter(|entry| pattern.is_match(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        matches
    }

    /// Call a service on the hub
    ///
    /// `data` keys are merged over `{ entity_id }`; when no entity is
    /// targeted the `entity_id` key is absent from the options entirely.
    /// Both the success value and any failure are surfaced to the caller;
    /// there is no automatic retry.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: Option<&str>,
        data: serde_json::Value,
    ) -> BrokerResult<serde_json::Value> {
        let mut options = serde_json::Map::new();
        if let Some(entity_id) = entity_id {
            options.insert(
                "entity_id".to_string(),
                serde_json::Value::String(entity_id.to_string()),
            );
        }
        if let serde_json::Value::Object(data) = data {
            for (key, value) in data {
                options.insert(key, value);
            }
        }
        debug!(domain, service, "calling service");
        let result = self
            .connection
            .call_service(domain, service, serde_json::Value::Object(options))
            .await?;
        Ok(result)
    }

    /// Register a state-change listener for an entity
    pub fn on_state(&self, entity_id: impl Into<String>, callback: StateCallback) -> SubscriptionId {
        let id = self.next_id();
        let entity_id = entity_id.into();
        trace!(entity_id = %entity_id, subscription = %id, "registering state listener");
        self.state_listeners
            .entry(entity_id)
            .or_default()
            .push(StateListener { id, callback });
        id
    }

    /// Register an automation-trigger listener for an automation entity
    pub fn on_automation(
        &self,
        entity_id: impl Into<String>,
        callback: AutomationCallback,
    ) -> SubscriptionId {
        let id = self.next_id();
        let entity_id = entity_id.into();
        trace!(entity_id = %entity_id, subscription = %id, "registering automation listener");
        self.automation_listeners
            .entry(entity_id)
            .or_default()
            .push(AutomationListener { id, callback });
        id
    }

    /// Remove a state listener by id
    ///
    /// Prunes the entity key when its last listener goes; removing an
    /// unknown id is a no-op.
    pub fn clear_on_state(&self, entity_id: &str, id: SubscriptionId) {
        if let Entry::Occupied(mut entry) = self.state_listeners.entry(entity_id.to_string()) {
            entry.get_mut().retain(|listener| listener.id != id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Remove an automation listener by id; same pruning and no-op rules
    /// as `clear_on_state`
    pub fn clear_on_automation(&self, entity_id: &str, id: SubscriptionId) {
        if let Entry::Occupied(mut entry) = self.automation_listeners.entry(entity_id.to_string()) {
            entry.get_mut().retain(|listener| listener.id != id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Number of entities with at least one state listener
    pub fn state_listener_count(&self) -> usize {
        self.state_listeners.len()
    }

    /// Number of automation entities with at least one listener
    pub fn automation_listener_count(&self) -> usize {
        self.automation_listeners.len()
    }

    /// Dispatch a state-changed event
    ///
    /// The cache entry is replaced wholesale before any listener runs. A
    /// null new state is ignored entirely: no cache update, no dispatch.
    /// Listeners fire in registration order; a failing callback is logged
    /// and does not stop dispatch to its siblings.
    pub async fn dispatch_state_changed(&self, payload: StateChangedPayload) {
        let Some(new_state) = payload.new_state else {
            trace!(entity_id = %payload.entity_id, "ignoring state change without new state");
            return;
        };
        self.states
            .insert(payload.entity_id.clone(), new_state.clone());

        let listeners: Vec<(SubscriptionId, StateCallback)> =
            match self.state_listeners.get(&payload.entity_id) {
                Some(entry) => entry
                    .iter()
                    .map(|listener| (listener.id, Arc::clone(&listener.callback)))
                    .collect(),
                None => return,
            };

        for (id, callback) in listeners {
            // A listener removed mid-dispatch must not fire
            if !self.state_listener_registered(&payload.entity_id, id) {
                continue;
            }
            if let Err(err) = callback(new_state.clone(), payload.old_state.clone()).await {
                error!(
                    entity_id = %payload.entity_id,
                    subscription = %id,
                    %err,
                    "state listener failed"
                );
            }
        }
    }

    /// Dispatch an automation-triggered event with the same ordering and
    /// isolation rules as state dispatch
    pub async fn dispatch_automation_triggered(&self, payload: AutomationTriggeredPayload) {
        debug!(entity_id = %payload.entity_id, name = %payload.name, "automation triggered");
        let listeners: Vec<(SubscriptionId, AutomationCallback)> =
            match self.automation_listeners.get(&payload.entity_id) {
                Some(entry) => entry
                    .iter()
                    .map(|listener| (listener.id, Arc::clone(&listener.callback)))
                    .collect(),
                None => return,
            };

        for (id, callback) in listeners {
            if !self.automation_listener_registered(&payload.entity_id, id) {
                continue;
            }
            if let Err(err) = callback().await {
                error!(
                    entity_id = %payload.entity_id,
                    subscription = %id,
                    %err,
                    "automation listener failed"
                );
            }
        }
    }

    fn state_listener_registered(&self, entity_id: &str, id: SubscriptionId) -> bool {
        self.state_listeners
            .get(entity_id)
            .is_some_and(|listeners| listeners.iter().any(|l| l.id == id))
    }

    fn automation_listener_registered(&self, entity_id: &str, id: SubscriptionId) -> bool {
        self.automation_listeners
            .get(entity_id)
            .is_some_and(|listeners| listeners.iter().any(|l| l.id == id))
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst))
    }
}
