//! Per-module runtime: tracked subscriptions and scheduling primitives
//!
//! Every automation module instance is backed by one `ModuleRuntime`. The
//! runtime wraps the broker's listener registration so subscriptions can be
//! released on unload, tracks every timeout/interval handle it hands out,
//! and runs two internal polling loops per instance: one fires delayed
//! run-at tasks whose target time has passed, the other fires per-minute
//! callbacks on each minute-boundary crossing. `destroy` tears all of it
//! down exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use hearth_broker::{SharedBroker, SubscriptionId};
use hearth_core::EntityState;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Poll period for the delayed-task queue
const RUN_AT_POLL: Duration = Duration::from_millis(250);

/// Poll period for minute-boundary detection
const MINUTE_POLL: Duration = Duration::from_millis(500);

/// Opaque handle for a tracked timeout or interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cancellable id for a delayed or per-minute task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type TaskCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wall-clock source for the polling loops
///
/// Defaults to the system clock; tests inject a controllable one.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>);

impl Clock {
    /// The system wall clock
    pub fn system() -> Self {
        Self(Arc::new(Utc::now))
    }

    /// A clock backed by an arbitrary time source
    pub fn from_fn(source: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self(Arc::new(source))
    }

    /// The current time according to this clock
    pub fn now(&self) -> DateTime<Utc> {
        (self.0)()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}

struct DelayedTask {
    at: DateTime<Utc>,
    callback: TaskCallback,
}

struct RuntimeInner {
    next_id: AtomicU64,
    timeouts: DashMap<TimerId, JoinHandle<()>>,
    intervals: DashMap<TimerId, JoinHandle<()>>,
    delayed: DashMap<TaskId, DelayedTask>,
    per_minute: DashMap<TaskId, TaskCallback>,
    /// Last observed minute-of-hour
    last_minute: AtomicU32,
    clock: Clock,
}

/// The base every automation module instance builds on
///
/// Lifecycle: `constructed -> active -> destroyed`, with no way back; a
/// reload always constructs a brand-new runtime. Everything registered
/// through this runtime is owned by it and released by [`destroy`].
///
/// [`destroy`]: ModuleRuntime::destroy
pub struct ModuleRuntime {
    title: String,
    broker: SharedBroker,
    inner: Arc<RuntimeInner>,
    /// Broker subscriptions owned by this instance, for release on destroy
    state_subs: DashMap<SubscriptionId, String>,
    automation_subs: DashMap<SubscriptionId, String>,
    destroyed: AtomicBool,
}

impl ModuleRuntime {
    /// Create a runtime for a module and start its two polling loops
    pub fn new(title: impl Into<String>, broker: SharedBroker) -> Self {
        Self::with_clock(title, broker, Clock::system())
    }

    /// Like [`new`], with an explicit wall-clock source (test support)
    ///
    /// [`new`]: ModuleRuntime::new
    pub fn with_clock(title: impl Into<String>, broker: SharedBroker, clock: Clock) -> Self {
        let title = title.into();
        let inner = Arc::new(RuntimeInner {
            next_id: AtomicU64::new(1),
            timeouts: DashMap::new(),
            intervals: DashMap::new(),
            delayed: DashMap::new(),
            per_minute: DashMap::new(),
            last_minute: AtomicU32::new(clock.now().minute()),
            clock,
        });
        let runtime = Self {
            title,
            broker,
            inner,
            state_subs: DashMap::new(),
            automation_subs: DashMap::new(),
            destroyed: AtomicBool::new(false),
        };
        runtime.spawn_run_at_poller();
        runtime.spawn_minute_poller();
        info!(module = %runtime.title, "automation module loaded");
        runtime
    }

    /// The module's human-readable title
    pub fn title(&self) -> &str {
        &self.title
    }

    /// The broker this runtime registers against
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// Whether `destroy` has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Subscribe to state changes for an entity, tracked for release
    pub fn on_state<F, Fut>(&self, entity_id: &str, callback: F) -> SubscriptionId
    where
        F: Fn(EntityState, Option<EntityState>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.refuse_if_destroyed("on_state") {
            return SubscriptionId::default();
        }
        let id = self
            .broker
            .on_state(entity_id, Arc::new(move |new, old| callback(new, old).boxed()));
        self.state_subs.insert(id, entity_id.to_string());
        id
    }

    /// Subscribe to state changes that land on a specific state value
    ///
    /// The callback only fires when the new state equals `value`.
    pub fn on_state_value<F, Fut>(&self, entity_id: &str, value: &str, callback: F) -> SubscriptionId
    where
        F: Fn(EntityState, Option<EntityState>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let value = value.to_string();
        let callback = Arc::new(callback);
        self.on_state(entity_id, move |new: EntityState, old: Option<EntityState>| {
            let callback = Arc::clone(&callback);
            let value = value.clone();
            async move {
                if new.state == value {
                    callback(new, old).await
                } else {
                    Ok(())
                }
            }
        })
    }

    /// Subscribe to an automation's trigger events, tracked for release
    pub fn on_automation<F, Fut>(&self, entity_id: &str, callback: F) -> SubscriptionId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.refuse_if_destroyed("on_automation") {
            return SubscriptionId::default();
        }
        let id = self
            .broker
            .on_automation(entity_id, Arc::new(move || callback().boxed()));
        self.automation_subs.insert(id, entity_id.to_string());
        id
    }

    /// Release a tracked state subscription
    pub fn clear_on_state(&self, id: SubscriptionId) {
        if let Some((_, entity_id)) = self.state_subs.remove(&id) {
            self.broker.clear_on_state(&entity_id, id);
        }
    }

    /// Release a tracked automation subscription
    pub fn clear_on_automation(&self, id: SubscriptionId) {
        if let Some((_, entity_id)) = self.automation_subs.remove(&id) {
            self.broker.clear_on_automation(&entity_id, id);
        }
    }

    /// Run a callback once after a delay; the handle is tracked
    pub fn set_timeout<F, Fut>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let id = self.next_timer_id();
        if self.refuse_if_destroyed("set_timeout") {
            return id;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.timeouts.remove(&id);
            if let Err(err) = callback().await {
                error!(timer = %id, %err, "timeout callback failed");
            }
        });
        self.inner.timeouts.insert(id, handle);
        id
    }

    /// Cancel a tracked timeout and drop its tracking entry
    pub fn clear_timeout(&self, id: TimerId) {
        if let Some((_, handle)) = self.inner.timeouts.remove(&id) {
            handle.abort();
        }
    }

    /// Run a callback repeatedly with a fixed period; the handle is tracked
    ///
    /// The first invocation happens one period after registration.
    pub fn set_interval<F, Fut>(&self, period: Duration, callback: F) -> TimerId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_timer_id();
        if self.refuse_if_destroyed("set_interval") {
            return id;
        }
        let callback: TaskCallback = Arc::new(move || callback().boxed());
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(err) = callback().await {
                    error!(timer = %id, %err, "interval callback failed");
                }
            }
        });
        self.inner.intervals.insert(id, handle);
        id
    }

    /// Cancel a tracked interval and drop its tracking entry
    pub fn clear_interval(&self, id: TimerId) {
        if let Some((_, handle)) = self.inner.intervals.remove(&id) {
            handle.abort();
        }
    }

    /// Schedule a one-shot callback for a wall-clock time
    ///
    /// The task fires on the first poll after its target time passes,
    /// however late that poll runs, and is removed from the queue before
    /// its callback is invoked: no skipped overdue tasks, no double fire.
    pub fn run_at<F, Fut>(&self, at: DateTime<Utc>, callback: F) -> TaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_task_id();
        if self.refuse_if_destroyed("run_at") {
            return id;
        }
        self.inner.delayed.insert(
            id,
            DelayedTask {
                at,
                callback: Arc::new(move || callback().boxed()),
            },
        );
        debug!(module = %self.title, task = %id, at = %at, "delayed task scheduled");
        id
    }

    /// Cancel a pending delayed task
    ///
    /// Guaranteed not to fire after cancellation; cancelling a task that
    /// already fired is a no-op.
    pub fn cancel_run_at(&self, id: TaskId) {
        self.inner.delayed.remove(&id);
    }

    /// Register a callback fired once per observed minute boundary
    pub fn each_minute<F, Fut>(&self, callback: F) -> TaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_task_id();
        if self.refuse_if_destroyed("each_minute") {
            return id;
        }
        self.inner
            .per_minute
            .insert(id, Arc::new(move || callback().boxed()));
        id
    }

    /// Remove a per-minute callback
    pub fn cancel_each_minute(&self, id: TaskId) {
        self.inner.per_minute.remove(&id);
    }

    /// Number of pending delayed tasks (tracked work, not business state)
    pub fn pending_delayed(&self) -> usize {
        self.inner.delayed.len()
    }

    /// Release everything this instance owns
    ///
    /// Order: timeouts, intervals (the two polling loops included), pending
    /// delayed tasks, state subscriptions, automation subscriptions, then
    /// the per-minute list. Idempotent; each release step is isolated so a
    /// single failure cannot abort the rest. Aborted tasks are awaited, so
    /// none of this module's callbacks run after `destroy` returns.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(module = %self.title, "destroying module");

        Self::shutdown_tasks(&self.inner.timeouts).await;
        Self::shutdown_tasks(&self.inner.intervals).await;
        self.inner.delayed.clear();

        let subs: Vec<(SubscriptionId, String)> = self
            .state_subs
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (id, entity_id) in subs {
            self.broker.clear_on_state(&entity_id, id);
        }
        self.state_subs.clear();

        let subs: Vec<(SubscriptionId, String)> = self
            .automation_subs
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (id, entity_id) in subs {
            self.broker.clear_on_automation(&entity_id, id);
        }
        self.automation_subs.clear();

        self.inner.per_minute.clear();
    }

    async fn shutdown_tasks(tasks: &DashMap<TimerId, JoinHandle<()>>) {
        let ids: Vec<TimerId> = tasks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, handle)) = tasks.remove(&id) {
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    fn spawn_run_at_poller(&self) {
        let id = self.next_timer_id();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(RUN_AT_POLL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let now = inner.clock.now();
                let mut due: Vec<TaskId> = inner
                    .delayed
                    .iter()
                    .filter(|entry| entry.value().at <= now)
                    .map(|entry| *entry.key())
                    .collect();
                due.sort();
                for task_id in due {
                    // Removed before it runs, so a late poll never double-fires
                    let Some((_, task)) = inner.delayed.remove(&task_id) else {
                        continue;
                    };
                    if let Err(err) = (task.callback)().await {
                        error!(task = %task_id, %err, "delayed task failed");
                    }
                }
            }
        });
        self.inner.intervals.insert(id, handle);
    }

    fn spawn_minute_poller(&self) {
        let id = self.next_timer_id();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(MINUTE_POLL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let minute = inner.clock.now().minute();
                if inner.last_minute.swap(minute, Ordering::SeqCst) == minute {
                    continue;
                }
                let mut callbacks: Vec<(TaskId, TaskCallback)> = inner
                    .per_minute
                    .iter()
                    .map(|entry| (*entry.key(), Arc::clone(entry.value())))
                    .collect();
                callbacks.sort_by_key(|(task_id, _)| *task_id);
                for (task_id, callback) in callbacks {
                    if let Err(err) = callback().await {
                        error!(task = %task_id, %err, "per-minute task failed");
                    }
                }
            }
        });
        self.inner.intervals.insert(id, handle);
    }

    fn refuse_if_destroyed(&self, operation: &str) -> bool {
        let destroyed = self.destroyed.load(Ordering::SeqCst);
        if destroyed {
            warn!(module = %self.title, operation, "ignoring registration on destroyed module");
        }
        destroyed
    }

    fn next_timer_id(&self) -> TimerId {
        TimerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn next_task_id(&self) -> TaskId {
        TaskId(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }
}
