// Copyright 2025 Cowboy AI, LLC.

//! Liveness probing
//!
//! One polling task per connected identity pings the service at an interval
//! that depends on its state and reports every result as a
//! [`HealthCheckCompleted`] fact. A sweep reports identities stuck in
//! INITIALIZING. The monitor never changes state itself.

use crate::client::{ClientError, ServiceClient};
use crate::config::HealthConfig;
use crate::connection::duration_ms;
use crate::errors::{LifecycleError, LifecycleResult};
use crate::event_bus::{EventBus, EventHandler};
use crate::events::{
    EventEnvelope, EventType, HealthCheckCompleted, LifecycleEvent, ServiceTimeout, TimeoutKind,
};
use crate::identity::ServiceIdentity;
use crate::lifecycle::LifecycleManager;
use crate::state_machine::ServiceConnectionState;
use crate::tasks::{TaskRegistry, DEFAULT_GRACE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Event source name of the health monitor
pub const SOURCE: &str = "health_monitor";

/// Event types the health monitor reacts to
pub const HANDLED_EVENTS: [EventType; 3] = [
    EventType::ServiceConnected,
    EventType::StateChanged,
    EventType::ServiceRemoveRequested,
];

const SWEEP_TASK: &str = "health-initialization-sweep";

/// Result of one probe
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckResult {
    /// Probed identity
    pub identity: ServiceIdentity,
    /// Whether the service answered
    pub success: bool,
    /// Observed latency on success
    pub response_time: Option<Duration>,
    /// Error on failure
    pub error: Option<String>,
    /// When the probe finished
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    fn into_event(self, manual: bool) -> LifecycleEvent {
        LifecycleEvent::HealthCheckCompleted(HealthCheckCompleted {
            identity: self.identity,
            success: self.success,
            response_time_ms: self.response_time.map(duration_ms),
            error: self.error,
            manual,
        })
    }
}

#[derive(Clone)]
struct Prober {
    client: Arc<dyn ServiceClient>,
    lifecycle: Arc<LifecycleManager>,
    bus: Arc<EventBus>,
    config: HealthConfig,
}

impl Prober {
    async fn probe(&self, identity: &ServiceIdentity) -> HealthCheckResult {
        let outcome = match tokio::time::timeout(self.config.probe_timeout, self.client.ping(identity)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(duration_ms(self.config.probe_timeout))),
        };
        let checked_at = Utc::now();
        match outcome {
            Ok(latency) => HealthCheckResult {
                identity: identity.clone(),
                success: true,
                response_time: Some(latency),
                error: None,
                checked_at,
            },
            Err(e) => HealthCheckResult {
                identity: identity.clone(),
                success: false,
                response_time: None,
                error: Some(e.to_string()),
                checked_at,
            },
        }
    }

    fn interval_for(&self, state: ServiceConnectionState) -> Duration {
        match state {
            ServiceConnectionState::Healthy => self.config.healthy_interval,
            _ => self.config.warning_interval,
        }
    }

    async fn poll(self, identity: ServiceIdentity, mut signal: crate::tasks::ShutdownSignal) {
        debug!(identity = %identity, "Health polling started");
        loop {
            let state = match self.lifecycle.get_state(&identity).await {
                Ok(Some(state)) if state.is_probed() => state,
                Ok(_) => break,
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Could not read state for health poll");
                    ServiceConnectionState::Warning
                }
            };

            if !signal.sleep(self.interval_for(state)).await {
                break;
            }

            let result = self.probe(&identity).await;
            if !result.success {
                debug!(identity = %identity, error = ?result.error, "Health check failed");
            }
            if let Err(e) = self.bus.emit(result.into_event(false), SOURCE, false).await {
                debug!(identity = %identity, error = %e, "Health result not delivered");
                break;
            }
        }
        debug!(identity = %identity, "Health polling stopped");
    }

    async fn sweep_once(&self) -> LifecycleResult<usize> {
        let now = Utc::now();
        let mut reported = 0;
        for identity in self
            .lifecycle
            .identities_in(&[ServiceConnectionState::Initializing])
            .await?
        {
            let Some(meta) = self.lifecycle.get_metadata(&identity).await? else {
                continue;
            };
            let elapsed = meta.time_in_state(now);
            if elapsed <= self.config.initialization_timeout {
                continue;
            }
            info!(identity = %identity, elapsed_ms = duration_ms(elapsed), "Initialization timed out");
            let event = LifecycleEvent::ServiceTimeout(ServiceTimeout {
                identity,
                kind: TimeoutKind::Initialization,
                elapsed_ms: duration_ms(elapsed),
            });
            self.bus.emit(event, SOURCE, true).await?;
            reported += 1;
        }
        Ok(reported)
    }
}

/// Periodic and on-demand liveness probes
pub struct HealthMonitor {
    prober: Prober,
    tasks: TaskRegistry,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("monitored", &self.tasks.len())
            .finish()
    }
}

impl HealthMonitor {
    /// Create a monitor
    pub fn new(
        client: Arc<dyn ServiceClient>,
        lifecycle: Arc<LifecycleManager>,
        bus: Arc<EventBus>,
        config: HealthConfig,
    ) -> Self {
        Self {
            prober: Prober {
                client,
                lifecycle,
                bus,
                config,
            },
            tasks: TaskRegistry::new(),
        }
    }

    fn task_key(identity: &ServiceIdentity) -> String {
        format!("health:{}", identity.key())
    }

    /// Start (or restart) periodic probes for an identity
    pub fn start_monitoring(&self, identity: &ServiceIdentity) {
        let prober = self.prober.clone();
        let id = identity.clone();
        self.tasks
            .spawn_cancellable(Self::task_key(identity), move |signal| prober.poll(id, signal));
    }

    /// Stop periodic probes for an identity
    pub fn stop_monitoring(&self, identity: &ServiceIdentity) -> bool {
        self.tasks.cancel(&Self::task_key(identity))
    }

    /// Whether an identity is being polled
    pub fn is_monitoring(&self, identity: &ServiceIdentity) -> bool {
        self.tasks.is_running(&Self::task_key(identity))
    }

    /// Probe now, publish the result synchronously and return it
    pub async fn check_now(&self, identity: &ServiceIdentity) -> LifecycleResult<HealthCheckResult> {
        if self.prober.lifecycle.get_state(identity).await?.is_none() {
            return Err(LifecycleError::ServiceNotFound(identity.key()));
        }
        let result = self.prober.probe(identity).await;
        self.prober
            .bus
            .emit(result.clone().into_event(true), SOURCE, true)
            .await?;
        Ok(result)
    }

    /// Report identities stuck in INITIALIZING once
    pub async fn sweep_initialization(&self) -> LifecycleResult<usize> {
        self.prober.sweep_once().await
    }

    /// Start the initialization sweep loop
    pub fn start(&self) {
        let prober = self.prober.clone();
        self.tasks.spawn_cancellable(SWEEP_TASK, move |mut signal| async move {
            let interval = prober.config.initialization_sweep_interval;
            while signal.sleep(interval).await {
                if let Err(e) = prober.sweep_once().await {
                    warn!(error = %e, "Initialization sweep failed");
                }
            }
        });
    }

    /// Stop every probe task and the sweep
    pub async fn stop_all(&self) {
        self.tasks.shutdown(DEFAULT_GRACE).await;
    }
}

#[async_trait]
impl EventHandler for HealthMonitor {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn handle(&self, envelope: &EventEnvelope) -> LifecycleResult<()> {
        match &envelope.event {
            LifecycleEvent::ServiceConnected(e) => self.start_monitoring(&e.identity),
            LifecycleEvent::StateChanged(e) => {
                if matches!(
                    e.new_state,
                    ServiceConnectionState::Disconnected
                        | ServiceConnectionState::Unreachable
                        | ServiceConnectionState::Reconnecting
                ) && self.stop_monitoring(&e.identity)
                {
                    debug!(identity = %e.identity, state = %e.new_state, "Health polling cancelled");
                }
            }
            LifecycleEvent::ServiceRemoveRequested(e) => {
                self.stop_monitoring(&e.identity);
            }
            _ => {}
        }
        Ok(())
    }
}
