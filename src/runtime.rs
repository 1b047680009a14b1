// Copyright 2025 Cowboy AI, LLC.

//! Composition root
//!
//! [`LifecycleRuntime`] builds every component exactly once, subscribes them
//! to the bus and owns their background loops. Components only hold `Arc`s
//! to their collaborators; none of them can reach the runtime.

use crate::application::ServiceApplicationService;
use crate::cache::{self, CacheManager};
use crate::client::ServiceClient;
use crate::config::CoreConfig;
use crate::connection::{self, ConnectionManager};
use crate::errors::{LifecycleError, LifecycleResult};
use crate::event_bus::{EventBus, EventHandler};
use crate::events::EventType;
use crate::health::{self, HealthMonitor};
use crate::infrastructure::event_store::{EventStore, KvEventStore};
use crate::infrastructure::event_syncer::EventSyncer;
use crate::infrastructure::kv_store::KeyValueStore;
use crate::infrastructure::nats_kv_store::NatsKvStore;
use crate::lifecycle::{self, LifecycleManager};
use crate::reconnection::{self, ReconnectionScheduler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Subscription priority of the cache manager
pub const CACHE_PRIORITY: i32 = 100;
/// Subscription priority of the lifecycle manager
pub const LIFECYCLE_PRIORITY: i32 = 90;
/// Subscription priority of the health monitor
pub const HEALTH_PRIORITY: i32 = 50;
/// Subscription priority of the reconnection scheduler
pub const RECONNECTION_PRIORITY: i32 = 40;
/// Subscription priority of the connection manager
pub const CONNECTION_PRIORITY: i32 = 10;

/// Builder for [`LifecycleRuntime`]
#[derive(Default)]
pub struct LifecycleRuntimeBuilder {
    config: Option<CoreConfig>,
    store: Option<Arc<dyn KeyValueStore>>,
    client: Option<Arc<dyn ServiceClient>>,
}

impl LifecycleRuntimeBuilder {
    /// Use `config` instead of [`CoreConfig::default`]
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Shared store; NATS KV from the config is used when omitted
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wire client driving the services
    pub fn client(mut self, client: Arc<dyn ServiceClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Validate the config and wire every component
    pub async fn build(self) -> LifecycleResult<LifecycleRuntime> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let client = self
            .client
            .ok_or_else(|| LifecycleError::validation("a service client is required"))?;
        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(NatsKvStore::connect(config.nats.clone()).await?),
        };
        LifecycleRuntime::wire(config, store, client).await
    }
}

/// Every component of the engine, wired together
pub struct LifecycleRuntime {
    config: CoreConfig,
    store: Arc<dyn KeyValueStore>,
    event_store: Arc<dyn EventStore>,
    bus: Arc<EventBus>,
    lifecycle: Arc<LifecycleManager>,
    cache: Arc<CacheManager>,
    health: Arc<HealthMonitor>,
    connection: Arc<ConnectionManager>,
    reconnection: Arc<ReconnectionScheduler>,
    syncer: Option<Arc<EventSyncer>>,
    application: ServiceApplicationService,
    started: AtomicBool,
}

impl std::fmt::Debug for LifecycleRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleRuntime")
            .field("instance_id", &self.config.instance_id)
            .field("durable_queue", &self.syncer.is_some())
            .field("started", &self.is_started())
            .finish()
    }
}

async fn subscribe<H>(bus: &EventBus, handler: &Arc<H>, event_types: &[EventType], priority: i32)
where
    H: EventHandler + 'static,
{
    for event_type in event_types {
        let handler: Arc<dyn EventHandler> = handler.clone();
        bus.subscribe(*event_type, handler, priority).await;
    }
}

impl LifecycleRuntime {
    /// Start building a runtime
    pub fn builder() -> LifecycleRuntimeBuilder {
        LifecycleRuntimeBuilder::default()
    }

    async fn wire(
        config: CoreConfig,
        store: Arc<dyn KeyValueStore>,
        client: Arc<dyn ServiceClient>,
    ) -> LifecycleResult<Self> {
        let bus = Arc::new(EventBus::new());
        let event_store: Arc<dyn EventStore> = Arc::new(KvEventStore::new(store.clone()));

        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            bus.clone(),
            config.lifecycle.clone(),
        ));
        let cache = Arc::new(CacheManager::new(store.clone(), bus.clone()));
        let health = Arc::new(HealthMonitor::new(
            client.clone(),
            lifecycle.clone(),
            bus.clone(),
            config.health.clone(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            client,
            lifecycle.clone(),
            bus.clone(),
            config.connection.clone(),
        ));
        let reconnection = Arc::new(ReconnectionScheduler::new(
            lifecycle.clone(),
            bus.clone(),
            event_store.clone(),
            config.reconnection.clone(),
            config.instance_id.clone(),
        )
        .with_attempt_timeout(config.connection.connect_timeout));

        subscribe(&bus, &cache, &cache::HANDLED_EVENTS, CACHE_PRIORITY).await;
        subscribe(&bus, &lifecycle, &lifecycle::HANDLED_EVENTS, LIFECYCLE_PRIORITY).await;
        subscribe(&bus, &health, &health::HANDLED_EVENTS, HEALTH_PRIORITY).await;
        subscribe(&bus, &reconnection, &reconnection::HANDLED_EVENTS, RECONNECTION_PRIORITY).await;
        subscribe(&bus, &connection, &connection::HANDLED_EVENTS, CONNECTION_PRIORITY).await;

        let mut application = ServiceApplicationService::new(
            lifecycle.clone(),
            cache.clone(),
            health.clone(),
            bus.clone(),
            config.application.clone(),
        );
        let syncer = if config.application.durable_queue {
            let syncer = Arc::new(EventSyncer::new(
                event_store.clone(),
                bus.clone(),
                config.sync.clone(),
                config.instance_id.clone(),
            ));
            application = application.with_durable_queue(event_store.clone(), Some(syncer.clone()));
            Some(syncer)
        } else {
            None
        };

        info!(
            instance_id = %config.instance_id,
            durable_queue = syncer.is_some(),
            "Lifecycle runtime wired"
        );
        Ok(Self {
            config,
            store,
            event_store,
            bus,
            lifecycle,
            cache,
            health,
            connection,
            reconnection,
            syncer,
            application,
            started: AtomicBool::new(false),
        })
    }

    /// Start the bus and every background loop; repeated calls are no-ops
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bus.start();
        self.health.start();
        self.reconnection.start();
        if let Some(syncer) = &self.syncer {
            syncer.start();
        }
        info!(instance_id = %self.config.instance_id, "Lifecycle runtime started");
    }

    /// Whether [`LifecycleRuntime::start`] ran
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Stop every loop, release leases and drain the bus
    pub async fn shutdown(&self) {
        self.reconnection.shutdown().await;
        if let Some(syncer) = &self.syncer {
            syncer.shutdown().await;
        }
        self.health.stop_all().await;
        self.connection.shutdown().await;
        self.bus.shutdown().await;
        self.started.store(false, Ordering::Release);
        info!(instance_id = %self.config.instance_id, "Lifecycle runtime stopped");
    }

    /// Entry point for callers
    pub fn application(&self) -> &ServiceApplicationService {
        &self.application
    }

    /// Configuration in force
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Shared store
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Durable event log over the shared store
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.event_store
    }

    /// Local bus
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// State machine owner
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Service cache
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Health monitor
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Connection manager
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Reconnection scheduler
    pub fn reconnection(&self) -> &Arc<ReconnectionScheduler> {
        &self.reconnection
    }

    /// Event syncer, present with durable queuing
    pub fn syncer(&self) -> Option<&Arc<EventSyncer>> {
        self.syncer.as_ref()
    }
}
