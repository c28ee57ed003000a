//! End-to-end lifecycle: connection events drive state sync, module load,
//! event delivery, and unload on close.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hearth_broker::{Broker, Connection, ConnectionResult, ModuleHost, SharedBroker};
use hearth_core::{EntityState, HubEvent, ModulesConfig, StateChangedPayload};
use hearth_modules::{AutomationModule, LifecycleManager, ModuleRegistry, ModuleRuntime};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct FakeHub {
    states: Mutex<Vec<EntityState>>,
    service_calls: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl FakeHub {
    fn new(states: Vec<EntityState>) -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(states),
            service_calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Connection for FakeHub {
    async fn get_states(&self) -> ConnectionResult<Vec<EntityState>> {
        Ok(self.states.lock().unwrap().clone())
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        options: serde_json::Value,
    ) -> ConnectionResult<serde_json::Value> {
        self.service_calls
            .lock()
            .unwrap()
            .push((domain.to_string(), service.to_string(), options));
        Ok(serde_json::json!({"ok": true}))
    }

    async fn set_state(
        &self,
        _entity_id: &str,
        body: serde_json::Value,
    ) -> ConnectionResult<serde_json::Value> {
        Ok(body)
    }
}

/// Turns the litter box light off whenever the door closes
struct LitterBoxModule {
    broker: SharedBroker,
}

impl AutomationModule for LitterBoxModule {
    fn title(&self) -> &str {
        "litter box light"
    }

    fn setup(&self, runtime: &ModuleRuntime) -> anyhow::Result<()> {
        let broker = Arc::clone(&self.broker);
        runtime.on_state_value("binary_sensor.litter_door", "closed", move |_, _| {
            let broker = Arc::clone(&broker);
            async move {
                broker
                    .call_service(
                        "light",
                        "turn_off",
                        Some("light.litter_box"),
                        serde_json::Value::Null,
                    )
                    .await?;
                Ok(())
            }
        });
        Ok(())
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn test_full_lifecycle_ready_dispatch_close() {
    init_logging();
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("litter.rs"), "// module\n").unwrap();

    let hub = FakeHub::new(vec![
        EntityState::new("light.litter_box", "on"),
        EntityState::new("binary_sensor.litter_door", "open"),
    ]);
    let broker: SharedBroker = Arc::new(Broker::new(hub.clone()));

    let registry = Arc::new(ModuleRegistry::new());
    let module_broker = Arc::clone(&broker);
    registry.register("litter.rs", move || {
        Ok(Box::new(LitterBoxModule {
            broker: Arc::clone(&module_broker),
        }) as Box<dyn AutomationModule>)
    });

    let manager = LifecycleManager::new(
        Arc::clone(&broker),
        registry,
        ModulesConfig::new(dir.path()),
    )
    .unwrap();

    let (events, rx) = mpsc::channel(16);
    let run_broker = Arc::clone(&broker);
    let host: Arc<dyn ModuleHost> = Arc::new(manager.clone());
    let runner = tokio::spawn(async move { run_broker.run(rx, host).await });

    // Ready: states sync, then modules load
    events.send(HubEvent::Ready).await.unwrap();
    let manager_probe = manager.clone();
    wait_for(move || manager_probe.is_loaded(Path::new("litter.rs"))).await;
    assert_eq!(broker.get_state("light.litter_box").unwrap().state, "on");

    // A non-matching state change does nothing
    events
        .send(HubEvent::StateChanged(StateChangedPayload {
            entity_id: "binary_sensor.litter_door".to_string(),
            new_state: Some(EntityState::new("binary_sensor.litter_door", "open")),
            old_state: None,
        }))
        .await
        .unwrap();

    // The matching value triggers the module's service call
    events
        .send(HubEvent::StateChanged(StateChangedPayload {
            entity_id: "binary_sensor.litter_door".to_string(),
            new_state: Some(EntityState::new("binary_sensor.litter_door", "closed")),
            old_state: Some(EntityState::new("binary_sensor.litter_door", "open")),
        }))
        .await
        .unwrap();

    let hub_probe = hub.clone();
    wait_for(move || !hub_probe.service_calls.lock().unwrap().is_empty()).await;
    {
        let calls = hub.service_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (domain, service, options) = &calls[0];
        assert_eq!(domain, "light");
        assert_eq!(service, "turn_off");
        assert_eq!(options, &serde_json::json!({"entity_id": "light.litter_box"}));
    }

    // The cache tracked the dispatched change
    assert_eq!(
        broker.get_state("binary_sensor.litter_door").unwrap().state,
        "closed"
    );

    // Close unloads every module and releases its listeners
    events.send(HubEvent::Closed).await.unwrap();
    let manager_probe = manager.clone();
    wait_for(move || manager_probe.loaded_count() == 0).await;
    assert_eq!(broker.state_listener_count(), 0);

    // Reconnect loads a fresh instance
    events.send(HubEvent::Ready).await.unwrap();
    let manager_probe = manager.clone();
    wait_for(move || manager_probe.loaded_count() == 1).await;

    drop(events);
    runner.await.unwrap();
}

#[tokio::test]
async fn test_sync_failure_skips_module_load() {
    struct FailingHub;

    #[async_trait]
    impl Connection for FailingHub {
        async fn get_states(&self) -> ConnectionResult<Vec<EntityState>> {
            Err(hearth_broker::ConnectionError::Transport(
                "socket reset".to_string(),
            ))
        }

        async fn call_service(
            &self,
            _domain: &str,
            _service: &str,
            _options: serde_json::Value,
        ) -> ConnectionResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn set_state(
            &self,
            _entity_id: &str,
            body: serde_json::Value,
        ) -> ConnectionResult<serde_json::Value> {
            Ok(body)
        }
    }

    struct NeverModule {
        constructed: Arc<AtomicUsize>,
    }

    impl AutomationModule for NeverModule {
        fn setup(&self, _runtime: &ModuleRuntime) -> anyhow::Result<()> {
            self.constructed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("never.rs"), "// module\n").unwrap();

    let broker: SharedBroker = Arc::new(Broker::new(Arc::new(FailingHub)));
    let registry = Arc::new(ModuleRegistry::new());
    let constructed = Arc::new(AtomicUsize::new(0));
    let shared = Arc::clone(&constructed);
    registry.register("never.rs", move || {
        Ok(Box::new(NeverModule {
            constructed: Arc::clone(&shared),
        }) as Box<dyn AutomationModule>)
    });

    let manager = LifecycleManager::new(
        Arc::clone(&broker),
        registry,
        ModulesConfig::new(dir.path()),
    )
    .unwrap();

    let (events, rx) = mpsc::channel(4);
    let host: Arc<dyn ModuleHost> = Arc::new(manager.clone());
    let run_broker = Arc::clone(&broker);
    let runner = tokio::spawn(async move { run_broker.run(rx, host).await });

    events.send(HubEvent::Ready).await.unwrap();
    drop(events);
    runner.await.unwrap();

    // Modules never load against an unsynced cache
    assert_eq!(manager.loaded_count(), 0);
    assert_eq!(constructed.load(Ordering::SeqCst), 0);
}
