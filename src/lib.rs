// Copyright 2025 Cowboy AI, LLC.

//! # CIM Lifecycle
//!
//! Event-driven lifecycle orchestration for external tool services shared by
//! many tenants.
//!
//! Each (tenant, service) identity moves through a closed state machine:
//! INITIALIZING, STARTUP, HEALTHY, WARNING, RECONNECTING, CIRCUIT_OPEN,
//! UNREACHABLE, DISCONNECTING and DISCONNECTED. Components never call each
//! other to change state. They publish facts and intents on an in-process
//! [`EventBus`], and only the [`LifecycleManager`] writes state.
//!
//! - **CacheManager**: all-or-nothing caching of service records per tenant
//! - **LifecycleManager**: per-identity state machine and metadata
//! - **ConnectionManager**: drives `connect`/`disconnect` on the wire client
//! - **HealthMonitor**: periodic and on-demand probes
//! - **ReconnectionScheduler**: lease-guarded exponential backoff
//! - **EventStore / EventSyncer**: durable intent log shared across processes
//! - **ServiceApplicationService**: the entry point for callers
//!
//! The wire protocol stays outside the crate behind [`ServiceClient`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use cim_lifecycle::{CoreConfig, InMemoryKeyValueStore, LifecycleRuntime, ServiceClient, ServiceConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run(client: Arc<dyn ServiceClient>) -> cim_lifecycle::LifecycleResult<()> {
//! let runtime = LifecycleRuntime::builder()
//!     .config(CoreConfig::default())
//!     .store(Arc::new(InMemoryKeyValueStore::new()))
//!     .client(client)
//!     .build()
//!     .await?;
//! runtime.start();
//!
//! let added = runtime
//!     .application()
//!     .add_service(
//!         "default",
//!         "weather",
//!         ServiceConfig::remote("http://localhost:8000/mcp"),
//!         Duration::from_secs(5),
//!     )
//!     .await?;
//! println!("{} is {:?}", added.identity, added.state);
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod application;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
mod errors;
pub mod event_bus;
pub mod events;
pub mod health;
mod identity;
pub mod infrastructure;
pub mod lifecycle;
pub mod reconnection;
pub mod runtime;
mod state_machine;
pub mod tasks;

pub use application::{AddServiceResult, ServiceApplicationService};
pub use cache::{CacheManager, ClientConfigRecord, ServiceRecord, ToolStatus, ToolStatusMap};
pub use client::{ClientError, ConnectedSession, ServiceClient, ToolInfo};
pub use config::{
    ApplicationConfig, ConnectionConfig, CoreConfig, EventSyncConfig, HealthConfig,
    HealthThresholds, LifecycleConfig, ReconnectionConfig, ServiceConfig, ServiceDefinitions,
};
pub use connection::ConnectionManager;
pub use errors::{LifecycleError, LifecycleResult};
pub use event_bus::{EventBus, EventHandler};
pub use events::{
    EventEnvelope, EventPriority, EventType, HealthCheckCompleted, LifecycleEvent,
    ReconnectionRequested, ReconnectionScheduled, ServiceAddRequested, ServiceCacheFailed,
    ServiceCached, ServiceConnected, ServiceConnectionFailed, ServiceDisconnectRequested,
    ServiceRemoveRequested, ServiceResetRequested, ServiceRestartRequested, ServiceTimeout,
    SessionInfo, StateChanged, TimeoutKind,
};
pub use health::{HealthCheckResult, HealthMonitor};
pub use identity::{ClientId, ServiceIdentity};
pub use infrastructure::{
    collections, ConsumerOffset, DedupEntry, EventRecord, EventStore, EventStoreError,
    EventSyncer, InMemoryKeyValueStore, KeyValueStore, KeyValueStoreExt, KvEventStore,
    LeaseKeeper, LeaseRecord, NatsKvConfig, NatsKvStore, StoreError, SyncReport,
};
pub use lifecycle::LifecycleManager;
pub use reconnection::{BackoffPolicy, ReconnectionScheduler, ScanReport};
pub use runtime::{LifecycleRuntime, LifecycleRuntimeBuilder};
pub use state_machine::{
    ServiceConnectionState, ServiceStateMetadata, State, StateTransition, StateTransitions,
};
pub use tasks::{BackgroundTask, ShutdownSignal, TaskRegistry};
