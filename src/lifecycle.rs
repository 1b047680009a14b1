// Copyright 2025 Cowboy AI, LLC.

//! Owner of the per-identity connection state machine
//!
//! [`LifecycleManager`] is the only component that writes `service_state`.
//! Every state change and every metadata mutation for one identity goes
//! through the same async gate, so a probe result, a connect result and a
//! user intent for the same identity never interleave. Accepted transitions
//! are announced as [`StateChanged`] after the gate is released, which lets
//! subscribers call back into [`LifecycleManager::update_metadata`].

use crate::config::{HealthThresholds, LifecycleConfig};
use crate::errors::{LifecycleError, LifecycleResult};
use crate::event_bus::{EventBus, EventHandler};
use crate::events::{
    EventEnvelope, EventType, HealthCheckCompleted, LifecycleEvent, ServiceCached,
    ServiceConnected, ServiceConnectionFailed, ServiceTimeout, StateChanged, TimeoutKind,
};
use crate::identity::ServiceIdentity;
use crate::infrastructure::kv_store::{collections, KeyValueStore, KeyValueStoreExt};
use crate::state_machine::{
    ServiceConnectionState, ServiceStateMetadata, State, StateTransition, StateTransitions,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event source name of the lifecycle manager
pub const SOURCE: &str = "lifecycle_manager";

/// Event types the lifecycle manager reacts to
pub const HANDLED_EVENTS: [EventType; 9] = [
    EventType::ServiceCached,
    EventType::ServiceConnected,
    EventType::ServiceConnectionFailed,
    EventType::HealthCheckCompleted,
    EventType::ServiceTimeout,
    EventType::ServiceRestartRequested,
    EventType::ServiceResetRequested,
    EventType::ServiceDisconnectRequested,
    EventType::ServiceRemoveRequested,
];

type Move = Option<(ServiceConnectionState, String)>;

/// Per-identity state machine over the shared store
pub struct LifecycleManager {
    store: Arc<dyn KeyValueStore>,
    bus: Arc<EventBus>,
    defaults: HealthThresholds,
    tenant_thresholds: RwLock<HashMap<String, HealthThresholds>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Create a manager
    pub fn new(store: Arc<dyn KeyValueStore>, bus: Arc<EventBus>, config: LifecycleConfig) -> Self {
        Self {
            store,
            bus,
            defaults: config.thresholds,
            tenant_thresholds: RwLock::new(config.tenant_overrides),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Thresholds in force for `tenant_id`
    pub async fn thresholds_for(&self, tenant_id: &str) -> HealthThresholds {
        self.tenant_thresholds
            .read()
            .await
            .get(tenant_id)
            .copied()
            .unwrap_or(self.defaults)
    }

    /// Install a runtime override for one tenant
    pub async fn set_tenant_thresholds(&self, tenant_id: impl Into<String>, thresholds: HealthThresholds) {
        let tenant_id = tenant_id.into();
        info!(tenant_id = %tenant_id, ?thresholds, "Tenant thresholds overridden");
        self.tenant_thresholds.write().await.insert(tenant_id, thresholds);
    }

    /// Drop a tenant override, falling back to the process-wide defaults
    pub async fn clear_tenant_thresholds(&self, tenant_id: &str) -> bool {
        self.tenant_thresholds.write().await.remove(tenant_id).is_some()
    }

    /// Current state of an identity
    pub async fn get_state(&self, identity: &ServiceIdentity) -> LifecycleResult<Option<ServiceConnectionState>> {
        Ok(self
            .store
            .get_json(collections::SERVICE_STATE, &identity.key())
            .await?)
    }

    /// Current metadata of an identity
    pub async fn get_metadata(&self, identity: &ServiceIdentity) -> LifecycleResult<Option<ServiceStateMetadata>> {
        Ok(self
            .store
            .get_json(collections::SERVICE_METADATA, &identity.key())
            .await?)
    }

    /// Every tracked identity with its state
    pub async fn states(&self) -> LifecycleResult<Vec<(ServiceIdentity, ServiceConnectionState)>> {
        let entries = self
            .store
            .values_json::<ServiceConnectionState>(collections::SERVICE_STATE)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, state)| ServiceIdentity::from_key(&key).ok().map(|id| (id, state)))
            .collect())
    }

    /// Every tracked identity
    pub async fn identities(&self) -> LifecycleResult<Vec<ServiceIdentity>> {
        Ok(self.states().await?.into_iter().map(|(id, _)| id).collect())
    }

    /// Tracked identities currently in one of `states`
    pub async fn identities_in(&self, states: &[ServiceConnectionState]) -> LifecycleResult<Vec<ServiceIdentity>> {
        Ok(self
            .states()
            .await?
            .into_iter()
            .filter(|(_, state)| states.contains(state))
            .map(|(id, _)| id)
            .collect())
    }

    /// Move a tracked identity to `new_state`
    ///
    /// Returns `None` when the identity already is in `new_state`; nothing is
    /// emitted in that case.
    pub async fn transition(
        &self,
        identity: &ServiceIdentity,
        new_state: ServiceConnectionState,
        reason: &str,
        source: &str,
    ) -> LifecycleResult<Option<StateTransition>> {
        let reason = reason.to_string();
        self.apply(identity, source, true, move |current, _| {
            current.map(|_| (new_state, reason))
        })
        .await
    }

    /// Mutate the metadata of a tracked identity under its gate
    pub async fn update_metadata<F>(
        &self,
        identity: &ServiceIdentity,
        f: F,
    ) -> LifecycleResult<Option<ServiceStateMetadata>>
    where
        F: FnOnce(&mut ServiceStateMetadata) + Send,
    {
        let gate = self.gate(identity).await;
        let _guard = gate.lock().await;
        let key = identity.key();

        let Some(mut meta) = self
            .store
            .get_json::<ServiceStateMetadata>(collections::SERVICE_METADATA, &key)
            .await?
        else {
            return Ok(None);
        };
        f(&mut meta);
        self.store
            .put_json(collections::SERVICE_METADATA, &key, &meta)
            .await?;
        Ok(Some(meta))
    }

    async fn gate(&self, identity: &ServiceIdentity) -> Arc<Mutex<()>> {
        self.gates
            .lock()
            .await
            .entry(identity.key())
            .or_default()
            .clone()
    }

    /// Read, decide and write under the identity gate, then announce
    ///
    /// `decide` sees the current state and may mutate the metadata; it
    /// returns the target state, if any. With `strict`, an illegal target or
    /// an untracked identity is an error rather than a logged no-op.
    async fn apply<F>(
        &self,
        identity: &ServiceIdentity,
        source: &str,
        strict: bool,
        decide: F,
    ) -> LifecycleResult<Option<StateTransition>>
    where
        F: FnOnce(Option<ServiceConnectionState>, &mut Option<ServiceStateMetadata>) -> Move + Send,
    {
        let gate = self.gate(identity).await;
        let guard = gate.lock().await;
        let key = identity.key();

        let current: Option<ServiceConnectionState> =
            self.store.get_json(collections::SERVICE_STATE, &key).await?;
        if strict && current.is_none() {
            return Err(LifecycleError::ServiceNotFound(key));
        }
        let mut meta: Option<ServiceStateMetadata> =
            self.store.get_json(collections::SERVICE_METADATA, &key).await?;
        let before = meta.clone();

        let mut transition = None;
        if let Some((target, reason)) = decide(current, &mut meta) {
            let legal = current.map_or(true, |from| from.can_transition_to(&target));
            if current == Some(target) {
                debug!(identity = %identity, state = %target, "Already in target state");
            } else if !legal {
                let from = current.map_or("NONE", |s| s.name());
                if strict {
                    return Err(LifecycleError::InvalidStateTransition {
                        from: from.to_string(),
                        to: target.name().to_string(),
                    });
                }
                warn!(identity = %identity, from, to = %target, reason = %reason, "Rejected illegal transition");
            } else if let Some(m) = meta.as_mut() {
                let now = Utc::now();
                m.state_entered_time = now;
                m.last_transition_reason = Some(reason.clone());
                transition = Some(StateTransition {
                    identity: identity.clone(),
                    from: current,
                    to: target,
                    reason,
                    source: source.to_string(),
                    transition_id: Uuid::new_v4(),
                    timestamp: now,
                });
            } else {
                warn!(identity = %identity, to = %target, "No metadata for identity, transition skipped");
            }
        }

        if meta != before {
            if let Some(m) = &meta {
                self.store.put_json(collections::SERVICE_METADATA, &key, m).await?;
            }
        }
        if let Some(t) = &transition {
            self.store.put_json(collections::SERVICE_STATE, &key, &t.to).await?;
        }
        drop(guard);

        if let Some(t) = &transition {
            info!(
                identity = %identity,
                from = ?t.from,
                to = %t.to,
                reason = %t.reason,
                source = %t.source,
                "State transition"
            );
            let event = LifecycleEvent::StateChanged(StateChanged {
                identity: identity.clone(),
                old_state: t.from,
                new_state: t.to,
                reason: t.reason.clone(),
                source: t.source.clone(),
            });
            self.bus.emit(event, SOURCE, true).await?;
        }
        Ok(transition)
    }

    async fn on_cached(&self, event: &ServiceCached, source: &str) -> LifecycleResult<()> {
        let fresh = ServiceStateMetadata::new(
            event.identity.clone(),
            Some(event.client_id.clone()),
            event.config.clone(),
        );
        self.apply(&event.identity, source, false, move |current, meta| {
            use ServiceConnectionState::*;
            let replaced = meta
                .as_ref()
                .and_then(|m| m.client_id.as_ref())
                .is_some_and(|id| Some(id) != fresh.client_id.as_ref());

            if replaced {
                if let Some(existing) = meta.as_mut() {
                    existing.config = fresh.config;
                    existing.client_id = fresh.client_id;
                    existing.reset_counters();
                }
                return match current {
                    Some(Disconnecting) => None,
                    Some(Initializing) => Some((Startup, "service config replaced".to_string())),
                    _ => Some((Initializing, "service config replaced".to_string())),
                };
            }

            match current {
                None | Some(Disconnected) => {
                    match meta {
                        // Keep the snapshot taken on first add.
                        Some(existing) => {
                            existing.reset_counters();
                            if existing.client_id.is_none() {
                                existing.client_id = fresh.client_id;
                            }
                        }
                        None => *meta = Some(fresh),
                    }
                    Some((Initializing, "service cached".to_string()))
                }
                Some(_) => None,
            }
        })
        .await?;
        Ok(())
    }

    async fn on_connected(&self, event: &ServiceConnected, source: &str) -> LifecycleResult<()> {
        use ServiceConnectionState::*;
        let connect_time = Duration::from_millis(event.connect_time_ms);
        self.apply(&event.identity, source, false, move |current, meta| {
            let m = meta.as_mut()?;
            match current? {
                Initializing | Startup | Reconnecting | CircuitOpen | Warning => {
                    m.record_success(Some(connect_time));
                    m.clear_retry();
                    Some((Healthy, "service connected".to_string()))
                }
                Healthy => {
                    m.record_success(Some(connect_time));
                    None
                }
                _ => None,
            }
        })
        .await?;
        Ok(())
    }

    async fn on_connection_failed(&self, event: &ServiceConnectionFailed, source: &str) -> LifecycleResult<()> {
        use ServiceConnectionState::*;
        let thresholds = self.thresholds_for(&event.identity.tenant_id).await;
        let error = event.error.clone();
        self.apply(&event.identity, source, false, move |current, meta| {
            let m = meta.as_mut()?;
            match current? {
                Initializing | Startup => {
                    m.record_failure(error.clone());
                    Some((Reconnecting, format!("connection failed: {error}")))
                }
                Reconnecting => {
                    m.record_failure(error);
                    (m.consecutive_failures >= thresholds.circuit_open_failure_threshold).then(|| {
                        (
                            CircuitOpen,
                            format!("{} consecutive failures", m.consecutive_failures),
                        )
                    })
                }
                CircuitOpen => {
                    m.record_failure(error);
                    None
                }
                _ => None,
            }
        })
        .await?;
        Ok(())
    }

    async fn on_health_check(&self, event: &HealthCheckCompleted, source: &str) -> LifecycleResult<()> {
        use ServiceConnectionState::*;
        let thresholds = self.thresholds_for(&event.identity.tenant_id).await;
        let success = event.success;
        let response_time = event.response_time_ms.map(Duration::from_millis);
        let error = event
            .error
            .clone()
            .unwrap_or_else(|| "health check failed".to_string());

        self.apply(&event.identity, source, false, move |current, meta| {
            let current = current.filter(ServiceConnectionState::is_probed)?;
            let m = meta.as_mut()?;
            if success {
                m.record_success(response_time);
                return matches!(current, Warning | Initializing | Startup)
                    .then(|| (Healthy, "health check succeeded".to_string()));
            }

            m.record_failure(error);
            let failures = m.consecutive_failures;
            match current {
                Healthy if failures >= thresholds.warning_failure_threshold => {
                    Some((Warning, format!("{failures} consecutive health check failures")))
                }
                Warning if failures >= thresholds.reconnecting_failure_threshold => {
                    Some((Reconnecting, format!("{failures} consecutive health check failures")))
                }
                _ => None,
            }
        })
        .await?;
        Ok(())
    }

    async fn on_timeout(&self, event: &ServiceTimeout, source: &str) -> LifecycleResult<()> {
        use ServiceConnectionState::*;
        let kind = event.kind;
        let elapsed_ms = event.elapsed_ms;
        self.apply(&event.identity, source, false, move |current, meta| match (kind, current?) {
            (TimeoutKind::Reconnection, Reconnecting | CircuitOpen) => {
                if let Some(m) = meta.as_mut() {
                    m.next_retry_time = None;
                }
                Some((Unreachable, format!("gave up reconnecting after {elapsed_ms}ms")))
            }
            (TimeoutKind::Initialization, Initializing) => {
                if let Some(m) = meta.as_mut() {
                    m.record_failure(format!("initialization timed out after {elapsed_ms}ms"));
                }
                Some((Reconnecting, "initialization timed out".to_string()))
            }
            _ => None,
        })
        .await?;
        Ok(())
    }

    async fn on_restart(&self, identity: &ServiceIdentity, source: &str) -> LifecycleResult<()> {
        self.apply(identity, source, false, |current, meta| match current {
            Some(ServiceConnectionState::Disconnecting) | None => None,
            Some(_) => {
                if let Some(m) = meta.as_mut() {
                    m.clear_retry();
                    m.consecutive_failures = 0;
                }
                Some((ServiceConnectionState::Startup, "restart requested".to_string()))
            }
        })
        .await?;
        Ok(())
    }

    async fn on_reset(&self, identity: &ServiceIdentity, source: &str) -> LifecycleResult<()> {
        self.apply(identity, source, false, |current, meta| {
            current?;
            if let Some(m) = meta.as_mut() {
                m.reset_counters();
            }
            Some((ServiceConnectionState::Initializing, "reset requested".to_string()))
        })
        .await?;
        Ok(())
    }

    async fn disconnect(&self, identity: &ServiceIdentity, reason: &str, source: &str) -> LifecycleResult<()> {
        use ServiceConnectionState::*;
        let first = reason.to_string();
        self.apply(identity, source, false, move |current, _| match current? {
            Disconnecting | Disconnected => None,
            _ => Some((Disconnecting, first)),
        })
        .await?;

        let second = reason.to_string();
        self.apply(identity, source, false, move |current, meta| match current? {
            Disconnecting => {
                if let Some(m) = meta.as_mut() {
                    m.clear_retry();
                }
                Some((Disconnected, second))
            }
            _ => None,
        })
        .await?;
        Ok(())
    }

    async fn remove(&self, identity: &ServiceIdentity, source: &str) -> LifecycleResult<()> {
        self.disconnect(identity, "remove requested", source).await?;

        let key = identity.key();
        {
            let gate = self.gate(identity).await;
            let _guard = gate.lock().await;
            self.store.delete(collections::SERVICE_STATE, &key).await?;
            self.store.delete(collections::SERVICE_METADATA, &key).await?;
        }
        self.gates.lock().await.remove(&key);
        info!(identity = %identity, "Service state removed");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for LifecycleManager {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn handle(&self, envelope: &EventEnvelope) -> LifecycleResult<()> {
        let source = envelope.source.as_str();
        match &envelope.event {
            LifecycleEvent::ServiceCached(e) => self.on_cached(e, source).await,
            LifecycleEvent::ServiceConnected(e) => self.on_connected(e, source).await,
            LifecycleEvent::ServiceConnectionFailed(e) => self.on_connection_failed(e, source).await,
            LifecycleEvent::HealthCheckCompleted(e) => self.on_health_check(e, source).await,
            LifecycleEvent::ServiceTimeout(e) => self.on_timeout(e, source).await,
            LifecycleEvent::ServiceRestartRequested(e) => self.on_restart(&e.identity, source).await,
            LifecycleEvent::ServiceResetRequested(e) => self.on_reset(&e.identity, source).await,
            LifecycleEvent::ServiceDisconnectRequested(e) => {
                self.disconnect(&e.identity, &e.reason, source).await
            }
            LifecycleEvent::ServiceRemoveRequested(e) => self.remove(&e.identity, source).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::events::{ServiceDisconnectRequested, SessionInfo};
    use crate::identity::ClientId;
    use crate::infrastructure::kv_store::InMemoryKeyValueStore;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;
    use ServiceConnectionState::*;

    #[derive(Default)]
    struct Transitions(StdMutex<Vec<(Option<ServiceConnectionState>, ServiceConnectionState)>>);

    #[async_trait]
    impl EventHandler for Transitions {
        fn name(&self) -> &str {
            "transitions"
        }

        async fn handle(&self, envelope: &EventEnvelope) -> LifecycleResult<()> {
            if let LifecycleEvent::StateChanged(e) = &envelope.event {
                self.0.lock().unwrap().push((e.old_state, e.new_state));
            }
            Ok(())
        }
    }

    impl Transitions {
        fn take(&self) -> Vec<(Option<ServiceConnectionState>, ServiceConnectionState)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    async fn fixture() -> (Arc<LifecycleManager>, Arc<Transitions>, ServiceIdentity) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let bus = Arc::new(EventBus::new());
        let manager = Arc::new(LifecycleManager::new(store, bus.clone(), LifecycleConfig::default()));
        let seen = Arc::new(Transitions::default());
        bus.subscribe(EventType::StateChanged, seen.clone(), 0).await;
        (manager, seen, ServiceIdentity::new("default", "weather").unwrap())
    }

    async fn deliver(manager: &LifecycleManager, event: LifecycleEvent) {
        manager.handle(&EventEnvelope::new(event, "test")).await.unwrap();
    }

    fn cached(identity: &ServiceIdentity, url: &str) -> LifecycleEvent {
        let config = ServiceConfig::remote(url);
        LifecycleEvent::ServiceCached(ServiceCached {
            identity: identity.clone(),
            client_id: ClientId::derive(identity, &config).unwrap(),
            config,
        })
    }

    fn connected(identity: &ServiceIdentity) -> LifecycleEvent {
        LifecycleEvent::ServiceConnected(ServiceConnected {
            identity: identity.clone(),
            session: SessionInfo {
                session_id: "s-1".to_string(),
                connected_at: Utc::now(),
            },
            tools: vec![],
            connect_time_ms: 12,
        })
    }

    fn probe(identity: &ServiceIdentity, success: bool) -> LifecycleEvent {
        LifecycleEvent::HealthCheckCompleted(HealthCheckCompleted {
            identity: identity.clone(),
            success,
            response_time_ms: success.then_some(5),
            error: (!success).then(|| "timeout".to_string()),
            manual: false,
        })
    }

    fn connection_failed(identity: &ServiceIdentity) -> LifecycleEvent {
        LifecycleEvent::ServiceConnectionFailed(ServiceConnectionFailed {
            identity: identity.clone(),
            error: "refused".to_string(),
            retry_count: 0,
        })
    }

    #[tokio::test]
    async fn test_cached_then_connected() {
        let (manager, seen, id) = fixture().await;
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        deliver(&manager, connected(&id)).await;

        assert_eq!(seen.take(), vec![(None, Initializing), (Some(Initializing), Healthy)]);
        let meta = manager.get_metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.last_transition_reason.as_deref(), Some("service connected"));
        assert_eq!(manager.identities_in(&[Healthy]).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_duplicate_cache_preserves_snapshot() {
        let (manager, seen, id) = fixture().await;
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        let first = manager.get_metadata(&id).await.unwrap().unwrap();
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;

        assert_eq!(seen.take(), vec![(None, Initializing)]);
        assert_eq!(manager.get_metadata(&id).await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_changed_config_replaces_snapshot() {
        let (manager, seen, id) = fixture().await;
        deliver(&manager, cached(&id, "http://a:1/mcp")).await;
        deliver(&manager, connected(&id)).await;
        deliver(&manager, probe(&id, false)).await;
        seen.take();

        let replacement = ServiceConfig::remote("http://b:2/mcp");
        deliver(&manager, cached(&id, "http://b:2/mcp")).await;

        assert_eq!(seen.take(), vec![(Some(Warning), Initializing)]);
        let meta = manager.get_metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.config, replacement);
        assert_eq!(meta.client_id, Some(ClientId::derive(&id, &replacement).unwrap()));
        assert_eq!(meta.consecutive_failures, 0);

        // Replacing again while still initializing restarts the attempt.
        deliver(&manager, cached(&id, "http://c:3/mcp")).await;
        assert_eq!(seen.take(), vec![(Some(Initializing), Startup)]);
    }

    #[tokio::test]
    async fn test_initialization_timeout_starts_reconnecting() {
        let (manager, seen, id) = fixture().await;
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        seen.take();

        deliver(
            &manager,
            LifecycleEvent::ServiceTimeout(ServiceTimeout {
                identity: id.clone(),
                kind: TimeoutKind::Initialization,
                elapsed_ms: 30_000,
            }),
        )
        .await;
        assert_eq!(seen.take(), vec![(Some(Initializing), Reconnecting)]);
        let meta = manager.get_metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.consecutive_failures, 1);
        assert_eq!(
            meta.error_message.as_deref(),
            Some("initialization timed out after 30000ms")
        );

        // Only INITIALIZING identities react to it.
        deliver(&manager, connected(&id)).await;
        seen.take();
        deliver(
            &manager,
            LifecycleEvent::ServiceTimeout(ServiceTimeout {
                identity: id.clone(),
                kind: TimeoutKind::Initialization,
                elapsed_ms: 30_000,
            }),
        )
        .await;
        assert!(seen.take().is_empty());
    }

    #[tokio::test]
    async fn test_same_state_emits_nothing() {
        let (manager, seen, id) = fixture().await;
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        seen.take();

        let outcome = manager.transition(&id, Initializing, "again", "test").await.unwrap();
        assert!(outcome.is_none());
        assert!(seen.take().is_empty());
    }

    #[tokio::test]
    async fn test_probe_failures_degrade_step_by_step() {
        let (manager, seen, id) = fixture().await;
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        deliver(&manager, connected(&id)).await;
        seen.take();

        deliver(&manager, probe(&id, false)).await;
        assert_eq!(seen.take(), vec![(Some(Healthy), Warning)]);
        deliver(&manager, probe(&id, false)).await;
        assert_eq!(seen.take(), vec![(Some(Warning), Reconnecting)]);

        let meta = manager.get_metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.consecutive_failures, 2);
        assert_eq!(meta.error_message.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_warning_recovers_on_success() {
        let (manager, seen, id) = fixture().await;
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        deliver(&manager, connected(&id)).await;
        deliver(&manager, probe(&id, false)).await;
        seen.take();

        deliver(&manager, probe(&id, true)).await;
        assert_eq!(seen.take(), vec![(Some(Warning), Healthy)]);
        let meta = manager.get_metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.consecutive_failures, 0);
        assert_eq!(meta.last_response_time_ms, Some(5));
    }

    #[tokio::test]
    async fn test_tenant_override_changes_thresholds() {
        let (manager, seen, id) = fixture().await;
        manager
            .set_tenant_thresholds(
                "default",
                HealthThresholds {
                    warning_failure_threshold: 2,
                    ..HealthThresholds::default()
                },
            )
            .await;
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        deliver(&manager, connected(&id)).await;
        seen.take();

        deliver(&manager, probe(&id, false)).await;
        assert!(seen.take().is_empty());
        deliver(&manager, probe(&id, false)).await;
        assert_eq!(seen.take(), vec![(Some(Healthy), Warning)]);

        assert!(manager.clear_tenant_thresholds("default").await);
        assert_eq!(manager.thresholds_for("default").await, HealthThresholds::default());
    }

    #[tokio::test]
    async fn test_connection_failures_open_circuit() {
        let (manager, seen, id) = fixture().await;
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        seen.take();

        deliver(&manager, connection_failed(&id)).await;
        assert_eq!(seen.take(), vec![(Some(Initializing), Reconnecting)]);
        for _ in 0..4 {
            deliver(&manager, connection_failed(&id)).await;
        }
        assert_eq!(seen.take(), vec![(Some(Reconnecting), CircuitOpen)]);

        deliver(
            &manager,
            LifecycleEvent::ServiceTimeout(ServiceTimeout {
                identity: id.clone(),
                kind: TimeoutKind::Reconnection,
                elapsed_ms: 1000,
            }),
        )
        .await;
        assert_eq!(seen.take(), vec![(Some(CircuitOpen), Unreachable)]);
    }

    #[tokio::test]
    async fn test_disconnect_is_two_steps_and_remove_forgets() {
        let (manager, seen, id) = fixture().await;
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        seen.take();

        deliver(
            &manager,
            LifecycleEvent::ServiceDisconnectRequested(ServiceDisconnectRequested {
                identity: id.clone(),
                reason: "user".to_string(),
            }),
        )
        .await;
        assert_eq!(
            seen.take(),
            vec![(Some(Initializing), Disconnecting), (Some(Disconnecting), Disconnected)]
        );

        deliver(
            &manager,
            LifecycleEvent::ServiceRemoveRequested(crate::events::ServiceRemoveRequested {
                identity: id.clone(),
            }),
        )
        .await;
        assert!(manager.get_state(&id).await.unwrap().is_none());
        assert!(manager.get_metadata(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_strict_transition_errors() {
        let (manager, _seen, id) = fixture().await;
        let err = manager.transition(&id, Healthy, "x", "test").await.unwrap_err();
        assert!(err.is_not_found());

        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        let err = manager.transition(&id, Warning, "x", "test").await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_restart_and_reset() {
        let (manager, seen, id) = fixture().await;
        deliver(&manager, cached(&id, "http://localhost:8000/mcp")).await;
        deliver(&manager, connected(&id)).await;
        manager
            .update_metadata(&id, |m| m.reconnect_attempts = 4)
            .await
            .unwrap();
        seen.take();

        deliver(
            &manager,
            LifecycleEvent::ServiceRestartRequested(crate::events::ServiceRestartRequested {
                identity: id.clone(),
            }),
        )
        .await;
        assert_eq!(seen.take(), vec![(Some(Healthy), Startup)]);
        assert_eq!(manager.get_metadata(&id).await.unwrap().unwrap().reconnect_attempts, 0);

        deliver(
            &manager,
            LifecycleEvent::ServiceResetRequested(crate::events::ServiceResetRequested {
                identity: id.clone(),
            }),
        )
        .await;
        assert_eq!(seen.take(), vec![(Some(Startup), Initializing)]);
    }
}
