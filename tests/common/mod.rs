// Copyright 2025 Cowboy AI, LLC.

//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use cim_lifecycle::{
    ClientError, ConnectedSession, CoreConfig, EventEnvelope, EventHandler, EventType,
    InMemoryKeyValueStore, LifecycleEvent, LifecycleResult, LifecycleRuntime, ServiceClient,
    ServiceConfig, ServiceConnectionState, ServiceIdentity, ToolInfo,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wire client whose answers are scripted per call
#[derive(Debug, Default)]
pub struct ScriptedClient {
    connects: Mutex<VecDeque<(Duration, Result<Vec<&'static str>, ClientError>)>>,
    pings: Mutex<VecDeque<Result<Duration, ClientError>>>,
    pub connect_calls: AtomicUsize,
    pub ping_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a successful connect advertising `tools`
    pub fn connect_ok(&self, tools: &[&'static str]) {
        self.connect_ok_after(Duration::ZERO, tools);
    }

    /// Queue a connect that succeeds once `delay` has passed
    pub fn connect_ok_after(&self, delay: Duration, tools: &[&'static str]) {
        self.connects.lock().unwrap().push_back((delay, Ok(tools.to_vec())));
    }

    /// Queue a refused connect
    pub fn connect_refused(&self) {
        self.connects
            .lock()
            .unwrap()
            .push_back((Duration::ZERO, Err(ClientError::ConnectionRefused("scripted".to_string()))));
    }

    /// Queue one probe answer
    pub fn ping(&self, result: Result<Duration, ClientError>) {
        self.pings.lock().unwrap().push_back(result);
    }

    pub fn connects(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceClient for ScriptedClient {
    async fn connect(
        &self,
        identity: &ServiceIdentity,
        _config: &ServiceConfig,
    ) -> Result<ConnectedSession, ClientError> {
        let n = self.connect_calls.fetch_add(1, Ordering::SeqCst);
        // Unscripted connects succeed with no tools.
        let (delay, scripted) = self
            .connects
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((Duration::ZERO, Ok(vec![])));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        scripted.map(|tools| ConnectedSession {
            session_id: format!("{}-{n}", identity.service_name),
            tools: tools.into_iter().map(ToolInfo::named).collect(),
            connected_at: Utc::now(),
        })
    }

    async fn ping(&self, _identity: &ServiceIdentity) -> Result<Duration, ClientError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        self.pings
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Duration::from_millis(1)))
    }

    async fn disconnect(&self, _identity: &ServiceIdentity) -> Result<(), ClientError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every event it sees, in delivery order
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events().iter().map(LifecycleEvent::event_type).collect()
    }

    /// `(old, new)` of every recorded `StateChanged`
    pub fn transitions(&self) -> Vec<(Option<ServiceConnectionState>, ServiceConnectionState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                LifecycleEvent::StateChanged(e) => Some((e.old_state, e.new_state)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> LifecycleResult<()> {
        self.events.lock().unwrap().push(envelope.event.clone());
        Ok(())
    }
}

/// Config with every loop ticking in milliseconds
pub fn fast_config(instance_id: &str) -> CoreConfig {
    let mut config = CoreConfig {
        instance_id: instance_id.to_string(),
        ..CoreConfig::default()
    };
    config.health.healthy_interval = Duration::from_millis(20);
    config.health.warning_interval = Duration::from_millis(20);
    config.health.probe_timeout = Duration::from_millis(100);
    config.health.initialization_sweep_interval = Duration::from_millis(20);
    config.connection.connect_timeout = Duration::from_millis(100);
    config.reconnection.scan_interval = Duration::from_millis(10);
    config.reconnection.base_delay = Duration::from_millis(10);
    config.reconnection.max_delay = Duration::from_millis(40);
    config.sync.poll_interval = Duration::from_millis(10);
    config.sync.lease_retry_interval = Duration::from_millis(10);
    config.application.wait_poll_interval = Duration::from_millis(5);
    config
}

/// Route test logs through `RUST_LOG`, e.g. `RUST_LOG=cim_lifecycle=debug`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runtime with a recorder subscribed last to every event type
pub async fn runtime_with(
    config: CoreConfig,
    store: Arc<InMemoryKeyValueStore>,
    client: Arc<ScriptedClient>,
) -> (LifecycleRuntime, Arc<Recorder>) {
    init_tracing();
    let runtime = LifecycleRuntime::builder()
        .config(config)
        .store(store)
        .client(client)
        .build()
        .await
        .unwrap();
    let recorder = Recorder::new();
    runtime
        .bus()
        .subscribe_all(&EventType::ALL, recorder.clone(), i32::MIN)
        .await;
    (runtime, recorder)
}

pub fn weather() -> ServiceIdentity {
    ServiceIdentity::new("default", "weather").unwrap()
}

pub fn weather_config() -> ServiceConfig {
    ServiceConfig::remote("http://localhost:8000/mcp")
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
