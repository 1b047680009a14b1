// Copyright 2025 Cowboy AI, LLC.

//! Lifecycle events
//!
//! Events are either intents (something was requested) or facts (something
//! happened). They are immutable once published. The set is closed: every
//! kind has one concrete payload struct, one [`EventType`] tag, and one arm
//! in [`LifecycleEvent::from_payload`], which is the table the event log uses
//! to turn stored records back into typed events.

use crate::client::ToolInfo;
use crate::config::ServiceConfig;
use crate::errors::{LifecycleError, LifecycleResult};
use crate::identity::{ClientId, ServiceIdentity};
use crate::state_machine::ServiceConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Type tag of a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Intent: add a service
    ServiceAddRequested,
    /// Fact: cache records written
    ServiceCached,
    /// Fact: cache transaction rolled back
    ServiceCacheFailed,
    /// Fact: session established
    ServiceConnected,
    /// Fact: connect attempt failed
    ServiceConnectionFailed,
    /// Fact: state machine moved
    StateChanged,
    /// Fact: probe finished
    HealthCheckCompleted,
    /// Fact: a deadline passed
    ServiceTimeout,
    /// Intent: reconnect now
    ReconnectionRequested,
    /// Fact: next retry decided
    ReconnectionScheduled,
    /// Intent: restart a service
    ServiceRestartRequested,
    /// Intent: reset a service
    ServiceResetRequested,
    /// Intent: disconnect a service
    ServiceDisconnectRequested,
    /// Intent: remove a service
    ServiceRemoveRequested,
}

impl EventType {
    /// Every event type
    pub const ALL: [EventType; 14] = [
        Self::ServiceAddRequested,
        Self::ServiceCached,
        Self::ServiceCacheFailed,
        Self::ServiceConnected,
        Self::ServiceConnectionFailed,
        Self::StateChanged,
        Self::HealthCheckCompleted,
        Self::ServiceTimeout,
        Self::ReconnectionRequested,
        Self::ReconnectionScheduled,
        Self::ServiceRestartRequested,
        Self::ServiceResetRequested,
        Self::ServiceDisconnectRequested,
        Self::ServiceRemoveRequested,
    ];

    /// Stable wire tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceAddRequested => "service_add_requested",
            Self::ServiceCached => "service_cached",
            Self::ServiceCacheFailed => "service_cache_failed",
            Self::ServiceConnected => "service_connected",
            Self::ServiceConnectionFailed => "service_connection_failed",
            Self::StateChanged => "state_changed",
            Self::HealthCheckCompleted => "health_check_completed",
            Self::ServiceTimeout => "service_timeout",
            Self::ReconnectionRequested => "reconnection_requested",
            Self::ReconnectionScheduled => "reconnection_scheduled",
            Self::ServiceRestartRequested => "service_restart_requested",
            Self::ServiceResetRequested => "service_reset_requested",
            Self::ServiceDisconnectRequested => "service_disconnect_requested",
            Self::ServiceRemoveRequested => "service_remove_requested",
        }
    }

    /// Parse a wire tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == tag)
    }

    /// Intents ask for something; facts report it
    pub fn is_intent(&self) -> bool {
        matches!(
            self,
            Self::ServiceAddRequested
                | Self::ReconnectionRequested
                | Self::ServiceRestartRequested
                | Self::ServiceResetRequested
                | Self::ServiceDisconnectRequested
                | Self::ServiceRemoveRequested
        )
    }

    /// Default priority for events of this type
    pub fn default_priority(&self) -> EventPriority {
        match self {
            Self::ServiceDisconnectRequested | Self::ServiceRemoveRequested => {
                EventPriority::Critical
            }
            Self::ServiceAddRequested
            | Self::ServiceRestartRequested
            | Self::ServiceResetRequested
            | Self::ServiceTimeout => EventPriority::High,
            Self::HealthCheckCompleted | Self::ReconnectionScheduled => EventPriority::Low,
            _ => EventPriority::Normal,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority carried by an event envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Measurements and bookkeeping
    Low,
    /// Ordinary facts
    Normal,
    /// User intents and deadlines
    High,
    /// Teardown
    Critical,
}

/// Kind of deadline that passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Stuck in INITIALIZING
    Initialization,
    /// Retry ceiling exceeded
    Reconnection,
}

/// Session details cached for a connected service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Client-assigned session handle
    pub session_id: String,
    /// When the session was established
    pub connected_at: DateTime<Utc>,
}

/// Intent: add a service for a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAddRequested {
    /// Target identity
    pub identity: ServiceIdentity,
    /// Deterministic client id for (identity, config)
    pub client_id: ClientId,
    /// Service definition
    pub config: ServiceConfig,
}

/// Fact: every cache record for the identity is written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCached {
    /// Cached identity
    pub identity: ServiceIdentity,
    /// Client serving it
    pub client_id: ClientId,
    /// Config written to the cache
    pub config: ServiceConfig,
}

/// Fact: the cache transaction failed and was rolled back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCacheFailed {
    /// Identity that was being cached
    pub identity: ServiceIdentity,
    /// Step that failed
    pub step: String,
    /// Failure description
    pub error: String,
}

/// Fact: a session with the service is established
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConnected {
    /// Connected identity
    pub identity: ServiceIdentity,
    /// Session details
    pub session: SessionInfo,
    /// Tools advertised by the service
    pub tools: Vec<ToolInfo>,
    /// How long connect took, in milliseconds
    pub connect_time_ms: u64,
}

/// Fact: a connect attempt failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConnectionFailed {
    /// Identity that failed to connect
    pub identity: ServiceIdentity,
    /// Failure description
    pub error: String,
    /// Retry number that produced the attempt (0 for the first connect)
    pub retry_count: u32,
}

/// Fact: the state machine accepted a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChanged {
    /// Identity that moved
    pub identity: ServiceIdentity,
    /// Previous state, `None` on first entry
    pub old_state: Option<ServiceConnectionState>,
    /// New state
    pub new_state: ServiceConnectionState,
    /// Why
    pub reason: String,
    /// Who asked
    pub source: String,
}

/// Fact: a liveness probe finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckCompleted {
    /// Probed identity
    pub identity: ServiceIdentity,
    /// Probe outcome
    pub success: bool,
    /// Latency on success, in milliseconds
    pub response_time_ms: Option<u64>,
    /// Error on failure
    pub error: Option<String>,
    /// Triggered on demand rather than by the poll loop
    pub manual: bool,
}

/// Fact: a deadline passed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTimeout {
    /// Identity concerned
    pub identity: ServiceIdentity,
    /// Which deadline
    pub kind: TimeoutKind,
    /// Time spent before the deadline fired, in milliseconds
    pub elapsed_ms: u64,
}

/// Intent: try to reconnect now
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionRequested {
    /// Identity to reconnect
    pub identity: ServiceIdentity,
    /// Zero-based retry number
    pub retry_count: u32,
}

/// Fact: the next retry is scheduled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionScheduled {
    /// Identity to reconnect
    pub identity: ServiceIdentity,
    /// When the retry is due
    pub next_retry_time: DateTime<Utc>,
    /// Backoff delay applied, in milliseconds
    pub delay_ms: u64,
}

/// Intent: restart a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRestartRequested {
    /// Identity to restart
    pub identity: ServiceIdentity,
}

/// Intent: reset a service to a freshly cached state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResetRequested {
    /// Identity to reset
    pub identity: ServiceIdentity,
}

/// Intent: disconnect a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDisconnectRequested {
    /// Identity to disconnect
    pub identity: ServiceIdentity,
    /// Why
    pub reason: String,
}

/// Intent: disconnect a service and forget it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRemoveRequested {
    /// Identity to remove
    pub identity: ServiceIdentity,
}

/// Every lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Intent: add a service
    ServiceAddRequested(ServiceAddRequested),
    /// Fact: cache written
    ServiceCached(ServiceCached),
    /// Fact: cache rolled back
    ServiceCacheFailed(ServiceCacheFailed),
    /// Fact: connected
    ServiceConnected(ServiceConnected),
    /// Fact: connect failed
    ServiceConnectionFailed(ServiceConnectionFailed),
    /// Fact: state moved
    StateChanged(StateChanged),
    /// Fact: probe finished
    HealthCheckCompleted(HealthCheckCompleted),
    /// Fact: deadline passed
    ServiceTimeout(ServiceTimeout),
    /// Intent: reconnect
    ReconnectionRequested(ReconnectionRequested),
    /// Fact: retry scheduled
    ReconnectionScheduled(ReconnectionScheduled),
    /// Intent: restart
    ServiceRestartRequested(ServiceRestartRequested),
    /// Intent: reset
    ServiceResetRequested(ServiceResetRequested),
    /// Intent: disconnect
    ServiceDisconnectRequested(ServiceDisconnectRequested),
    /// Intent: remove
    ServiceRemoveRequested(ServiceRemoveRequested),
}

impl LifecycleEvent {
    /// Type tag of this event
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ServiceAddRequested(_) => EventType::ServiceAddRequested,
            Self::ServiceCached(_) => EventType::ServiceCached,
            Self::ServiceCacheFailed(_) => EventType::ServiceCacheFailed,
            Self::ServiceConnected(_) => EventType::ServiceConnected,
            Self::ServiceConnectionFailed(_) => EventType::ServiceConnectionFailed,
            Self::StateChanged(_) => EventType::StateChanged,
            Self::HealthCheckCompleted(_) => EventType::HealthCheckCompleted,
            Self::ServiceTimeout(_) => EventType::ServiceTimeout,
            Self::ReconnectionRequested(_) => EventType::ReconnectionRequested,
            Self::ReconnectionScheduled(_) => EventType::ReconnectionScheduled,
            Self::ServiceRestartRequested(_) => EventType::ServiceRestartRequested,
            Self::ServiceResetRequested(_) => EventType::ServiceResetRequested,
            Self::ServiceDisconnectRequested(_) => EventType::ServiceDisconnectRequested,
            Self::ServiceRemoveRequested(_) => EventType::ServiceRemoveRequested,
        }
    }

    /// Identity the event concerns
    pub fn identity(&self) -> &ServiceIdentity {
        match self {
            Self::ServiceAddRequested(e) => &e.identity,
            Self::ServiceCached(e) => &e.identity,
            Self::ServiceCacheFailed(e) => &e.identity,
            Self::ServiceConnected(e) => &e.identity,
            Self::ServiceConnectionFailed(e) => &e.identity,
            Self::StateChanged(e) => &e.identity,
            Self::HealthCheckCompleted(e) => &e.identity,
            Self::ServiceTimeout(e) => &e.identity,
            Self::ReconnectionRequested(e) => &e.identity,
            Self::ReconnectionScheduled(e) => &e.identity,
            Self::ServiceRestartRequested(e) => &e.identity,
            Self::ServiceResetRequested(e) => &e.identity,
            Self::ServiceDisconnectRequested(e) => &e.identity,
            Self::ServiceRemoveRequested(e) => &e.identity,
        }
    }

    /// Encode the payload alone, without the type tag
    pub fn payload(&self) -> LifecycleResult<serde_json::Value> {
        let value = match self {
            Self::ServiceAddRequested(e) => serde_json::to_value(e)?,
            Self::ServiceCached(e) => serde_json::to_value(e)?,
            Self::ServiceCacheFailed(e) => serde_json::to_value(e)?,
            Self::ServiceConnected(e) => serde_json::to_value(e)?,
            Self::ServiceConnectionFailed(e) => serde_json::to_value(e)?,
            Self::StateChanged(e) => serde_json::to_value(e)?,
            Self::HealthCheckCompleted(e) => serde_json::to_value(e)?,
            Self::ServiceTimeout(e) => serde_json::to_value(e)?,
            Self::ReconnectionRequested(e) => serde_json::to_value(e)?,
            Self::ReconnectionScheduled(e) => serde_json::to_value(e)?,
            Self::ServiceRestartRequested(e) => serde_json::to_value(e)?,
            Self::ServiceResetRequested(e) => serde_json::to_value(e)?,
            Self::ServiceDisconnectRequested(e) => serde_json::to_value(e)?,
            Self::ServiceRemoveRequested(e) => serde_json::to_value(e)?,
        };
        Ok(value)
    }

    /// Decode a payload for a known type tag
    pub fn from_payload(event_type: EventType, payload: serde_json::Value) -> LifecycleResult<Self> {
        let event = match event_type {
            EventType::ServiceAddRequested => Self::ServiceAddRequested(serde_json::from_value(payload)?),
            EventType::ServiceCached => Self::ServiceCached(serde_json::from_value(payload)?),
            EventType::ServiceCacheFailed => Self::ServiceCacheFailed(serde_json::from_value(payload)?),
            EventType::ServiceConnected => Self::ServiceConnected(serde_json::from_value(payload)?),
            EventType::ServiceConnectionFailed => {
                Self::ServiceConnectionFailed(serde_json::from_value(payload)?)
            }
            EventType::StateChanged => Self::StateChanged(serde_json::from_value(payload)?),
            EventType::HealthCheckCompleted => {
                Self::HealthCheckCompleted(serde_json::from_value(payload)?)
            }
            EventType::ServiceTimeout => Self::ServiceTimeout(serde_json::from_value(payload)?),
            EventType::ReconnectionRequested => {
                Self::ReconnectionRequested(serde_json::from_value(payload)?)
            }
            EventType::ReconnectionScheduled => {
                Self::ReconnectionScheduled(serde_json::from_value(payload)?)
            }
            EventType::ServiceRestartRequested => {
                Self::ServiceRestartRequested(serde_json::from_value(payload)?)
            }
            EventType::ServiceResetRequested => {
                Self::ServiceResetRequested(serde_json::from_value(payload)?)
            }
            EventType::ServiceDisconnectRequested => {
                Self::ServiceDisconnectRequested(serde_json::from_value(payload)?)
            }
            EventType::ServiceRemoveRequested => {
                Self::ServiceRemoveRequested(serde_json::from_value(payload)?)
            }
        };
        Ok(event)
    }

    /// Decode a payload for a wire tag
    pub fn from_tagged(tag: &str, payload: serde_json::Value) -> LifecycleResult<Self> {
        let event_type =
            EventType::from_tag(tag).ok_or_else(|| LifecycleError::UnknownEventType(tag.to_string()))?;
        Self::from_payload(event_type, payload)
    }
}

/// An event plus the metadata every consumer sees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique id of this logical event, stable across durable append retries
    pub event_id: Uuid,
    /// When the event was created
    pub occurred_at: DateTime<Utc>,
    /// Priority of the event
    pub priority: EventPriority,
    /// Component or process that raised it
    pub source: String,
    /// The event itself
    pub event: LifecycleEvent,
}

impl EventEnvelope {
    /// Wrap an event with a fresh id and its default priority
    pub fn new(event: LifecycleEvent, source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            priority: event.event_type().default_priority(),
            source: source.into(),
            event,
        }
    }

    /// Override the priority
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Type tag of the wrapped event
    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    /// Key used to recognize a duplicate application of this event
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.event_type(), self.event_id)
    }
}
