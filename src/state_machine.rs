// Copyright 2025 Cowboy AI, LLC.

//! Connection state machine for tracked services
//!
//! [`ServiceConnectionState`] is the closed set of states an identity can be
//! in. Which moves are legal is encoded in [`StateTransitions`]; the
//! [`LifecycleManager`](crate::lifecycle::LifecycleManager) is the only caller
//! that applies them.
//!
//! ```text
//!            ServiceCached
//!   (absent) ────────────► INITIALIZING ──connected──► HEALTHY ◄──────────┐
//!                              │                         │ failures      │ success
//!                   conn fail  │                         ▼               │
//!                              │                      WARNING ───────────┘
//!                              ▼                         │ failures
//!                        RECONNECTING ◄──────────────────┘
//!                         │        │ conn failures
//!                 timeout │        ▼
//!                         │   CIRCUIT_OPEN
//!                         ▼        │ timeout
//!                     UNREACHABLE ◄┘
//!
//!   any ──disconnect──► DISCONNECTING ──► DISCONNECTED
//!   any ──restart─────► STARTUP ──connected──► HEALTHY
//! ```

use crate::config::ServiceConfig;
use crate::identity::{ClientId, ServiceIdentity};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::time::Duration;
use uuid::Uuid;

/// Trait for types that can be used as states in a state machine
pub trait State: Debug + Clone + PartialEq + Eq + Send + Sync {
    /// Get the name of this state for logging/debugging
    fn name(&self) -> &'static str;

    /// Check if this is a terminal state
    fn is_terminal(&self) -> bool {
        false
    }
}

/// Legal moves between states
pub trait StateTransitions: State {
    /// Check if a transition to the target state is valid
    fn can_transition_to(&self, target: &Self) -> bool;

    /// Get all valid target states from this state
    fn valid_transitions(&self) -> Vec<Self>;
}

/// Connection state of one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceConnectionState {
    /// Cached, waiting for the first connection
    Initializing,
    /// Restart requested, connecting again
    Startup,
    /// Connected and answering probes
    Healthy,
    /// Probes failing, not yet given up on the session
    Warning,
    /// Session considered lost, retrying with backoff
    Reconnecting,
    /// Repeated connection failures, retrying with backoff
    CircuitOpen,
    /// Retry ceiling exceeded
    Unreachable,
    /// Disconnect in progress
    Disconnecting,
    /// Disconnected on request
    Disconnected,
}

impl ServiceConnectionState {
    /// Every state, in declaration order
    pub const ALL: [ServiceConnectionState; 9] = [
        Self::Initializing,
        Self::Startup,
        Self::Healthy,
        Self::Warning,
        Self::Reconnecting,
        Self::CircuitOpen,
        Self::Unreachable,
        Self::Disconnecting,
        Self::Disconnected,
    ];

    /// Still converging towards a first answer
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Initializing | Self::Startup)
    }

    /// Waiting on the reconnection scheduler
    pub fn needs_retry(&self) -> bool {
        matches!(self, Self::Reconnecting | Self::CircuitOpen)
    }

    /// Health probes should run in this state
    pub fn is_probed(&self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Startup | Self::Healthy | Self::Warning
        )
    }

    /// Tools of the service may be listed and called
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Healthy | Self::Warning)
    }

    /// A freshly connected session may be taken on in this state
    pub fn accepts_session(&self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::Startup
                | Self::Healthy
                | Self::Warning
                | Self::Reconnecting
                | Self::CircuitOpen
        )
    }
}

impl fmt::Display for ServiceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl State for ServiceConnectionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Startup => "STARTUP",
            Self::Healthy => "HEALTHY",
            Self::Warning => "WARNING",
            Self::Reconnecting => "RECONNECTING",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Unreachable => "UNREACHABLE",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

impl StateTransitions for ServiceConnectionState {
    fn can_transition_to(&self, target: &Self) -> bool {
        use ServiceConnectionState::*;

        // Reset and disconnect are reachable from everywhere they make sense.
        match (self, target) {
            (_, Initializing) => true,
            (Disconnecting, Disconnected) => true,
            (Disconnecting, _) => false,
            (Disconnected, Startup) => true,
            (Disconnected, _) => false,
            (_, Disconnecting) => true,
            (_, Startup) => true,

            (Initializing, Healthy | Reconnecting) => true,
            (Startup, Healthy | Reconnecting) => true,
            (Healthy, Warning | Reconnecting) => true,
            (Warning, Healthy | Reconnecting) => true,
            (Reconnecting, Healthy | CircuitOpen | Unreachable) => true,
            (CircuitOpen, Healthy | Reconnecting | Unreachable) => true,
            _ => false,
        }
    }

    fn valid_transitions(&self) -> Vec<Self> {
        Self::ALL
            .iter()
            .copied()
            .filter(|target| target != self && self.can_transition_to(target))
            .collect()
    }
}

/// Record of an accepted state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Identity that moved
    pub identity: ServiceIdentity,
    /// The state before the transition (`None` on first entry)
    pub from: Option<ServiceConnectionState>,
    /// The state after the transition
    pub to: ServiceConnectionState,
    /// Why the transition happened
    pub reason: String,
    /// Component that requested it
    pub source: String,
    /// Unique identifier for this transition instance
    pub transition_id: Uuid,
    /// When the transition occurred
    pub timestamp: DateTime<Utc>,
}

/// Operational counters and config snapshot for one identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceStateMetadata {
    /// Identity this metadata belongs to
    pub identity: ServiceIdentity,
    /// Client serving the identity
    pub client_id: Option<ClientId>,
    /// Config snapshot taken when the identity was first cached
    pub config: ServiceConfig,
    /// Failures (probe or connect) since the last success
    pub consecutive_failures: u32,
    /// Successful probes since the last failure
    pub consecutive_successes: u32,
    /// Reconnections requested since the last healthy state
    pub reconnect_attempts: u32,
    /// When the next reconnection is due
    pub next_retry_time: Option<DateTime<Utc>>,
    /// Last error observed
    pub error_message: Option<String>,
    /// When the current state was entered
    pub state_entered_time: DateTime<Utc>,
    /// When the last probe result arrived
    pub last_health_check: Option<DateTime<Utc>>,
    /// Latency of the last successful probe, in milliseconds
    pub last_response_time_ms: Option<u64>,
    /// Reason attached to the last transition
    pub last_transition_reason: Option<String>,
    /// When the metadata was created
    pub created_at: DateTime<Utc>,
}

impl ServiceStateMetadata {
    /// Fresh metadata with zeroed counters
    pub fn new(identity: ServiceIdentity, client_id: Option<ClientId>, config: ServiceConfig) -> Self {
        let now = Utc::now();
        Self {
            identity,
            client_id,
            config,
            consecutive_failures: 0,
            consecutive_successes: 0,
            reconnect_attempts: 0,
            next_retry_time: None,
            error_message: None,
            state_entered_time: now,
            last_health_check: None,
            last_response_time_ms: None,
            last_transition_reason: None,
            created_at: now,
        }
    }

    /// Count a successful probe or connection
    pub fn record_success(&mut self, response_time: Option<Duration>) {
        self.consecutive_failures = 0;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.error_message = None;
        self.last_health_check = Some(Utc::now());
        if let Some(latency) = response_time {
            self.last_response_time_ms = Some(latency.as_millis().min(u64::MAX as u128) as u64);
        }
    }

    /// Count a failed probe or connection
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.error_message = Some(error.into());
        self.last_health_check = Some(Utc::now());
    }

    /// Forget retry bookkeeping
    pub fn clear_retry(&mut self) {
        self.reconnect_attempts = 0;
        self.next_retry_time = None;
    }

    /// Zero every counter, keeping identity and config snapshot
    pub fn reset_counters(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.error_message = None;
        self.last_health_check = None;
        self.last_response_time_ms = None;
        self.clear_retry();
    }

    /// Time spent in the current state
    pub fn time_in_state(&self, now: DateTime<Utc>) -> Duration {
        (now - self.state_entered_time).to_std().unwrap_or_default()
    }
}
