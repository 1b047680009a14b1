// Copyright 2025 Cowboy AI, LLC.

//! Entry point for callers
//!
//! [`ServiceApplicationService`] validates requests, turns them into intents
//! and publishes them either on the local bus or durably through the event
//! log. It can wait for convergence but never raises on a wait timeout; the
//! best-known state is returned instead.

use crate::cache::{CacheManager, ServiceRecord};
use crate::client::ToolInfo;
use crate::config::{ApplicationConfig, ServiceConfig, ServiceDefinitions};
use crate::errors::{LifecycleError, LifecycleResult};
use crate::event_bus::EventBus;
use crate::events::{
    EventEnvelope, LifecycleEvent, ServiceAddRequested, ServiceDisconnectRequested,
    ServiceRemoveRequested, ServiceResetRequested, ServiceRestartRequested,
};
use crate::health::{HealthCheckResult, HealthMonitor};
use crate::identity::{ClientId, ServiceIdentity};
use crate::infrastructure::event_store::EventStore;
use crate::infrastructure::event_syncer::EventSyncer;
use crate::lifecycle::LifecycleManager;
use crate::reconnection::BackoffPolicy;
use crate::state_machine::{ServiceConnectionState, ServiceStateMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Event source name of the application service
pub const SOURCE: &str = "application_service";

/// Outcome of an add request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddServiceResult {
    /// Identity that was added
    pub identity: ServiceIdentity,
    /// Deterministic client id for the identity and config
    pub client_id: ClientId,
    /// Best-known state when the call returned
    pub state: Option<ServiceConnectionState>,
}

impl AddServiceResult {
    /// Whether the service converged out of its start-up states
    pub fn is_settled(&self) -> bool {
        self.state.is_some_and(|s| !s.is_transient())
    }
}

#[derive(Debug, Clone)]
struct DurableQueue {
    store: Arc<dyn EventStore>,
    syncer: Option<Arc<EventSyncer>>,
}

/// Facade over the lifecycle components
#[derive(Debug, Clone)]
pub struct ServiceApplicationService {
    lifecycle: Arc<LifecycleManager>,
    cache: Arc<CacheManager>,
    health: Arc<HealthMonitor>,
    bus: Arc<EventBus>,
    queue: Option<DurableQueue>,
    config: ApplicationConfig,
}

impl ServiceApplicationService {
    /// Service publishing intents on the local bus
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        cache: Arc<CacheManager>,
        health: Arc<HealthMonitor>,
        bus: Arc<EventBus>,
        config: ApplicationConfig,
    ) -> Self {
        Self {
            lifecycle,
            cache,
            health,
            bus,
            queue: None,
            config,
        }
    }

    /// Route intents through the durable event log
    ///
    /// With a syncer attached, each append is followed by a local sync pass
    /// so the caller observes its own write.
    pub fn with_durable_queue(mut self, store: Arc<dyn EventStore>, syncer: Option<Arc<EventSyncer>>) -> Self {
        self.queue = Some(DurableQueue { store, syncer });
        self
    }

    /// Whether intents go through the event log
    pub fn is_durable(&self) -> bool {
        self.queue.is_some()
    }

    /// Add one service and optionally wait for it to settle
    ///
    /// A zero `wait_timeout` returns right after publishing.
    pub async fn add_service(
        &self,
        tenant_id: &str,
        service_name: &str,
        config: ServiceConfig,
        wait_timeout: Duration,
    ) -> LifecycleResult<AddServiceResult> {
        let identity = ServiceIdentity::new(tenant_id, service_name)?;
        config.validate()?;
        let client_id = ClientId::derive(&identity, &config)?;

        info!(identity = %identity, client_id = %client_id, durable = self.is_durable(), "Adding service");
        let request = LifecycleEvent::ServiceAddRequested(ServiceAddRequested {
            identity: identity.clone(),
            client_id: client_id.clone(),
            config,
        });
        self.submit(request).await?;

        let state = if wait_timeout.is_zero() {
            self.lifecycle.get_state(&identity).await?
        } else {
            self.wait_for_settle(&identity, &client_id, wait_timeout).await?
        };
        Ok(AddServiceResult {
            identity,
            client_id,
            state,
        })
    }

    /// Add every service in `definitions` under one tenant
    ///
    /// Failures are reported per service; one bad entry does not stop the rest.
    pub async fn add_services(
        &self,
        tenant_id: &str,
        definitions: ServiceDefinitions,
        wait_timeout: Duration,
    ) -> BTreeMap<String, LifecycleResult<AddServiceResult>> {
        let mut outcomes = BTreeMap::new();
        for (name, config) in definitions {
            let outcome = self.add_service(tenant_id, &name, config, wait_timeout).await;
            if let Err(e) = &outcome {
                warn!(tenant_id, service_name = %name, error = %e, "Service not added");
            }
            outcomes.insert(name, outcome);
        }
        outcomes
    }

    /// Ask a tracked service to reconnect from scratch
    pub async fn restart_service(&self, identity: &ServiceIdentity) -> LifecycleResult<()> {
        self.require_tracked(identity).await?;
        self.submit(LifecycleEvent::ServiceRestartRequested(ServiceRestartRequested {
            identity: identity.clone(),
        }))
        .await
    }

    /// Zero counters and return a tracked service to INITIALIZING
    pub async fn reset_service(&self, identity: &ServiceIdentity) -> LifecycleResult<()> {
        self.require_tracked(identity).await?;
        self.submit(LifecycleEvent::ServiceResetRequested(ServiceResetRequested {
            identity: identity.clone(),
        }))
        .await
    }

    /// Disconnect a tracked service, keeping its records
    pub async fn disconnect_service(&self, identity: &ServiceIdentity, reason: &str) -> LifecycleResult<()> {
        self.require_tracked(identity).await?;
        self.submit(LifecycleEvent::ServiceDisconnectRequested(ServiceDisconnectRequested {
            identity: identity.clone(),
            reason: reason.to_string(),
        }))
        .await
    }

    /// Disconnect a tracked service and forget it
    pub async fn remove_service(&self, identity: &ServiceIdentity) -> LifecycleResult<()> {
        self.require_tracked(identity).await?;
        self.submit(LifecycleEvent::ServiceRemoveRequested(ServiceRemoveRequested {
            identity: identity.clone(),
        }))
        .await
    }

    /// Probe a service now
    pub async fn check_health(&self, identity: &ServiceIdentity) -> LifecycleResult<HealthCheckResult> {
        self.health.check_now(identity).await
    }

    /// Current state
    pub async fn get_state(&self, identity: &ServiceIdentity) -> LifecycleResult<Option<ServiceConnectionState>> {
        self.lifecycle.get_state(identity).await
    }

    /// Current metadata
    pub async fn get_metadata(&self, identity: &ServiceIdentity) -> LifecycleResult<Option<ServiceStateMetadata>> {
        self.lifecycle.get_metadata(identity).await
    }

    /// Services cached for a tenant
    pub async fn list_services(&self, tenant_id: &str) -> LifecycleResult<Vec<ServiceRecord>> {
        self.cache.list_services(tenant_id).await
    }

    /// Available tools of a service; empty unless the service is usable
    pub async fn list_tools(&self, identity: &ServiceIdentity) -> LifecycleResult<Vec<ToolInfo>> {
        match self.lifecycle.get_state(identity).await? {
            Some(state) if state.is_available() => self.cache.list_tools(identity).await,
            Some(_) => Ok(Vec::new()),
            None => Err(LifecycleError::ServiceNotFound(identity.key())),
        }
    }

    async fn require_tracked(&self, identity: &ServiceIdentity) -> LifecycleResult<()> {
        match self.lifecycle.get_state(identity).await? {
            Some(_) => Ok(()),
            None => Err(LifecycleError::ServiceNotFound(identity.key())),
        }
    }

    async fn submit(&self, event: LifecycleEvent) -> LifecycleResult<()> {
        let Some(queue) = &self.queue else {
            return self.bus.emit(event, SOURCE, false).await;
        };

        let envelope = EventEnvelope::new(event, SOURCE);
        self.append_with_retry(queue.store.as_ref(), &envelope).await?;
        if let Some(syncer) = &queue.syncer {
            // The write is durable; a failed local pass is picked up by the poll loop.
            if let Err(e) = syncer.consume_once().await {
                warn!(error = %e, "Read-your-write sync pass failed");
            }
        }
        Ok(())
    }

    async fn append_with_retry(&self, store: &dyn EventStore, envelope: &EventEnvelope) -> LifecycleResult<u64> {
        let event_type = envelope.event_type();
        let payload = envelope.event.payload()?;
        let dedup_key = envelope.dedup_key();
        let attempts = self.config.append_attempts.max(1);
        let backoff = BackoffPolicy::new(self.config.append_base_delay, Duration::MAX);

        let mut last_error = String::new();
        for attempt in 0..attempts {
            match store
                .append_event(event_type.as_str(), payload.clone(), SOURCE, Some(dedup_key.clone()))
                .await
            {
                Ok(record) => {
                    debug!(id = record.id, %event_type, attempt, "Intent appended");
                    return Ok(record.id);
                }
                Err(e) => {
                    warn!(%event_type, attempt = attempt + 1, attempts, error = %e, "Durable append failed");
                    last_error = e.to_string();
                    if attempt + 1 < attempts {
                        tokio::time::sleep(backoff.delay(attempt)).await;
                    }
                }
            }
        }
        Err(LifecycleError::QueueWriteExhausted { attempts, last_error })
    }

    /// Poll until `client_id` is in force and the state left the transient set
    async fn wait_for_settle(
        &self,
        identity: &ServiceIdentity,
        client_id: &ClientId,
        timeout: Duration,
    ) -> LifecycleResult<Option<ServiceConnectionState>> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.lifecycle.get_state(identity).await?;
            let current_client = self
                .lifecycle
                .get_metadata(identity)
                .await?
                .and_then(|m| m.client_id);
            if current_client.as_ref() == Some(client_id) && state.is_some_and(|s| !s.is_transient()) {
                return Ok(state);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(identity = %identity, state = ?state, "Wait for settle timed out");
                return Ok(state);
            }
            tokio::time::sleep(self.config.wait_poll_interval.min(deadline - now)).await;
        }
    }
}
