// Copyright 2025 Cowboy AI, LLC.

//! Connection establishment
//!
//! Turns "needs a connection" facts into calls on the wire client and
//! reports the outcome as facts. Never writes state.

use crate::client::{ClientError, ServiceClient};
use crate::config::ConnectionConfig;
use crate::errors::LifecycleResult;
use crate::event_bus::{EventBus, EventHandler};
use crate::events::{
    EventEnvelope, EventType, LifecycleEvent, ServiceConnected, ServiceConnectionFailed,
    SessionInfo,
};
use crate::identity::ServiceIdentity;
use crate::lifecycle::LifecycleManager;
use crate::state_machine::ServiceConnectionState;
use crate::tasks::{ShutdownSignal, TaskRegistry, DEFAULT_GRACE};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Event source name of the connection manager
pub const SOURCE: &str = "connection_manager";

/// Event types the connection manager reacts to
pub const HANDLED_EVENTS: [EventType; 2] = [EventType::StateChanged, EventType::ReconnectionRequested];

#[derive(Clone)]
struct Connector {
    client: Arc<dyn ServiceClient>,
    lifecycle: Arc<LifecycleManager>,
    bus: Arc<EventBus>,
    connect_timeout: Duration,
}

impl Connector {
    async fn connect(&self, identity: &ServiceIdentity, retry_count: u32) -> LifecycleResult<bool> {
        let Some(meta) = self.lifecycle.get_metadata(identity).await? else {
            debug!(identity = %identity, "No metadata, skipping connect");
            return Ok(false);
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.connect_timeout,
            self.client.connect(identity, &meta.config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(duration_ms(self.connect_timeout))),
        };

        match outcome {
            Ok(session) => {
                let state = self.lifecycle.get_state(identity).await?;
                if !state.is_some_and(|s| s.accepts_session()) {
                    info!(
                        identity = %identity,
                        state = ?state,
                        session_id = %session.session_id,
                        "Connected too late, dropping session"
                    );
                    self.disconnect(identity).await;
                    return Ok(false);
                }

                let connect_time_ms = duration_ms(started.elapsed());
                info!(
                    identity = %identity,
                    session_id = %session.session_id,
                    tools = session.tools.len(),
                    connect_time_ms,
                    "Service connected"
                );
                let event = LifecycleEvent::ServiceConnected(ServiceConnected {
                    identity: identity.clone(),
                    session: SessionInfo {
                        session_id: session.session_id,
                        connected_at: session.connected_at,
                    },
                    tools: session.tools,
                    connect_time_ms,
                });
                self.bus.emit(event, SOURCE, false).await?;
                Ok(true)
            }
            Err(e) => {
                warn!(identity = %identity, retry_count, error = %e, "Connect failed");
                let event = LifecycleEvent::ServiceConnectionFailed(ServiceConnectionFailed {
                    identity: identity.clone(),
                    error: e.to_string(),
                    retry_count,
                });
                self.bus.emit(event, SOURCE, false).await?;
                Ok(false)
            }
        }
    }

    async fn disconnect(&self, identity: &ServiceIdentity) {
        if let Err(e) = self.client.disconnect(identity).await {
            warn!(identity = %identity, error = %e, "Client disconnect failed");
        }
    }
}

/// Drives `connect` and `disconnect` on the wire client
///
/// At most one connect attempt runs per identity. Attempts are background
/// tasks, cancelled when the identity leaves the connectable states and on
/// [`ConnectionManager::shutdown`].
pub struct ConnectionManager {
    connector: Connector,
    attempts: TaskRegistry,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connect_timeout", &self.connector.connect_timeout)
            .field("attempts", &self.attempts.running())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a connection manager
    pub fn new(
        client: Arc<dyn ServiceClient>,
        lifecycle: Arc<LifecycleManager>,
        bus: Arc<EventBus>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            connector: Connector {
                client,
                lifecycle,
                bus,
                connect_timeout: config.connect_timeout,
            },
            attempts: TaskRegistry::new(),
        }
    }

    /// Start a connect attempt in the background
    ///
    /// With `replace`, a running attempt is cancelled in favour of the new
    /// one; otherwise the request is dropped while one runs. Returns whether
    /// an attempt was started.
    pub fn request_connect(&self, identity: ServiceIdentity, retry_count: u32, replace: bool) -> bool {
        let key = identity.key();
        let connector = self.connector.clone();
        let attempt = move |mut signal: ShutdownSignal| async move {
            tokio::select! {
                _ = signal.cancelled() => {
                    debug!(identity = %identity, "Connect attempt cancelled");
                }
                outcome = connector.connect(&identity, retry_count) => {
                    if let Err(e) = outcome {
                        warn!(identity = %identity, error = %e, "Failed to report connect outcome");
                    }
                }
            }
        };

        if replace {
            self.attempts.spawn_cancellable(key, attempt);
            true
        } else if self.attempts.spawn_if_idle(key.clone(), attempt) {
            true
        } else {
            debug!(identity = %key, "Connect already in flight");
            false
        }
    }

    /// Connect now and publish the outcome
    pub async fn connect(&self, identity: &ServiceIdentity, retry_count: u32) -> LifecycleResult<bool> {
        self.connector.connect(identity, retry_count).await
    }

    /// Whether a connect attempt is running for `identity`
    pub fn is_connecting(&self, identity: &ServiceIdentity) -> bool {
        self.attempts.is_running(&identity.key())
    }

    /// Cancel the running attempt for `identity`, if any
    pub fn cancel_connect(&self, identity: &ServiceIdentity) -> bool {
        self.attempts.cancel(&identity.key())
    }

    /// Cancel every running connect attempt
    pub async fn shutdown(&self) {
        self.attempts.shutdown(DEFAULT_GRACE).await;
        info!("Connection manager stopped");
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[async_trait]
impl EventHandler for ConnectionManager {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn handle(&self, envelope: &EventEnvelope) -> LifecycleResult<()> {
        match &envelope.event {
            LifecycleEvent::StateChanged(e) => match e.new_state {
                // Entering these asks for a fresh attempt with the current snapshot.
                ServiceConnectionState::Initializing | ServiceConnectionState::Startup => {
                    self.request_connect(e.identity.clone(), 0, true);
                }
                ServiceConnectionState::Unreachable | ServiceConnectionState::Disconnecting => {
                    self.cancel_connect(&e.identity);
                }
                ServiceConnectionState::Disconnected => {
                    self.cancel_connect(&e.identity);
                    self.connector.disconnect(&e.identity).await;
                }
                _ => {}
            },
            LifecycleEvent::ReconnectionRequested(e) => {
                self.request_connect(e.identity.clone(), e.retry_count, false);
            }
            _ => {}
        }
        Ok(())
    }
}
