// Copyright 2025 Cowboy AI, LLC.

//! Transactional service cache
//!
//! Adding a service writes four records, each recorded with a compensation
//! that restores the previous value:
//!
//! 1. `services[identity]` service record
//! 2. `tenant_clients[tenant]` client list
//! 3. `client_configs[client]` client config
//! 4. `service_clients[identity]` client id
//!
//! Re-adding an identity with a changed config replaces its client: the old
//! client config is deleted as a fifth, equally compensated, step.
//!
//! A failing step replays the compensations in reverse and publishes
//! [`ServiceCacheFailed`] instead of [`ServiceCached`]. Writers for one
//! tenant are serialized; reads are not guarded.

use crate::client::ToolInfo;
use crate::config::ServiceConfig;
use crate::errors::{LifecycleError, LifecycleResult};
use crate::event_bus::{EventBus, EventHandler};
use crate::events::{
    EventEnvelope, EventType, LifecycleEvent, ServiceAddRequested, ServiceCacheFailed,
    ServiceCached, ServiceConnected, SessionInfo,
};
use crate::identity::{ClientId, ServiceIdentity};
use crate::infrastructure::kv_store::{collections, KeyValueStore, KeyValueStoreExt, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Event source name of the cache manager
pub const SOURCE: &str = "cache_manager";

/// Event types the cache manager reacts to
pub const HANDLED_EVENTS: [EventType; 3] = [
    EventType::ServiceAddRequested,
    EventType::ServiceConnected,
    EventType::ServiceRemoveRequested,
];

/// A service registered for a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Identity of the service
    pub identity: ServiceIdentity,
    /// Client serving it
    pub client_id: ClientId,
    /// Service definition
    pub config: ServiceConfig,
    /// When it was first cached
    pub added_at: DateTime<Utc>,
}

/// Configuration stored per client id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfigRecord {
    /// The client
    pub client_id: ClientId,
    /// Identity it serves
    pub identity: ServiceIdentity,
    /// Service definition
    pub config: ServiceConfig,
    /// When it was written
    pub created_at: DateTime<Utc>,
}

/// Availability of one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStatus {
    /// Whether the tool may be listed and called
    pub available: bool,
    /// When the status last changed
    pub updated_at: DateTime<Utc>,
}

/// Per-tool status of one identity, in advertised order
pub type ToolStatusMap = IndexMap<String, ToolStatus>;

struct Compensation {
    step: &'static str,
    collection: &'static str,
    key: String,
    previous: Option<Value>,
}

/// One all-or-nothing add
struct CacheTransaction {
    store: Arc<dyn KeyValueStore>,
    applied: Vec<Compensation>,
}

impl CacheTransaction {
    fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            applied: Vec::new(),
        }
    }

    async fn write(
        &mut self,
        step: &'static str,
        collection: &'static str,
        key: &str,
        value: Value,
    ) -> Result<(), (&'static str, StoreError)> {
        let previous = self.store.get(collection, key).await.map_err(|e| (step, e))?;
        self.store
            .put(collection, key, value)
            .await
            .map_err(|e| (step, e))?;
        self.applied.push(Compensation {
            step,
            collection,
            key: key.to_string(),
            previous,
        });
        Ok(())
    }

    async fn remove(
        &mut self,
        step: &'static str,
        collection: &'static str,
        key: &str,
    ) -> Result<(), (&'static str, StoreError)> {
        let previous = self.store.get(collection, key).await.map_err(|e| (step, e))?;
        if previous.is_none() {
            return Ok(());
        }
        self.store
            .delete(collection, key)
            .await
            .map_err(|e| (step, e))?;
        self.applied.push(Compensation {
            step,
            collection,
            key: key.to_string(),
            previous,
        });
        Ok(())
    }

    async fn rollback(&mut self) {
        while let Some(compensation) = self.applied.pop() {
            let restored = match compensation.previous {
                Some(value) => self
                    .store
                    .put(compensation.collection, &compensation.key, value)
                    .await,
                None => self
                    .store
                    .delete(compensation.collection, &compensation.key)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = restored {
                warn!(
                    step = compensation.step,
                    collection = compensation.collection,
                    key = %compensation.key,
                    error = %e,
                    "Compensation failed"
                );
            }
        }
    }

    async fn add(&mut self, request: &ServiceAddRequested) -> Result<(), (&'static str, StoreError)> {
        let identity = &request.identity;
        let key = identity.key();
        let now = Utc::now();

        let record = ServiceRecord {
            identity: identity.clone(),
            client_id: request.client_id.clone(),
            config: request.config.clone(),
            added_at: now,
        };
        self.write("service_record", collections::SERVICES, &key, to_value(&record, "service_record")?)
            .await?;

        let previous_client: Option<ClientId> = self
            .store
            .get_json(collections::SERVICE_CLIENTS, &key)
            .await
            .map_err(|e| ("tenant_clients", e))?;
        let mut clients: Vec<ClientId> = self
            .store
            .get_json(collections::TENANT_CLIENTS, &identity.tenant_id)
            .await
            .map_err(|e| ("tenant_clients", e))?
            .unwrap_or_default();
        clients.retain(|c| Some(c) != previous_client.as_ref() && c != &request.client_id);
        clients.push(request.client_id.clone());
        self.write(
            "tenant_clients",
            collections::TENANT_CLIENTS,
            &identity.tenant_id,
            to_value(&clients, "tenant_clients")?,
        )
        .await?;

        let client_config = ClientConfigRecord {
            client_id: request.client_id.clone(),
            identity: identity.clone(),
            config: request.config.clone(),
            created_at: now,
        };
        self.write(
            "client_config",
            collections::CLIENT_CONFIGS,
            request.client_id.as_str(),
            to_value(&client_config, "client_config")?,
        )
        .await?;

        self.write(
            "service_client",
            collections::SERVICE_CLIENTS,
            &key,
            to_value(&request.client_id, "service_client")?,
        )
        .await?;

        // A changed config replaces the identity's client.
        if let Some(stale) = previous_client.filter(|c| c != &request.client_id) {
            self.remove("stale_client_config", collections::CLIENT_CONFIGS, stale.as_str())
                .await?;
        }
        Ok(())
    }
}

fn to_value<T: Serialize>(value: &T, step: &'static str) -> Result<Value, (&'static str, StoreError)> {
    serde_json::to_value(value).map_err(|e| (step, StoreError::from(e)))
}

/// Writer and reader of the per-tenant service cache
pub struct CacheManager {
    store: Arc<dyn KeyValueStore>,
    bus: Arc<EventBus>,
    tenant_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager").finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Create a cache manager
    pub fn new(store: Arc<dyn KeyValueStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            tenant_guards: Mutex::new(HashMap::new()),
        }
    }

    async fn tenant_guard(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        self.tenant_guards
            .lock()
            .await
            .entry(tenant_id.to_string())
            .or_default()
            .clone()
    }

    /// Cache a service for its tenant
    ///
    /// The transaction runs on its own task, so dropping the returned future
    /// never leaves it half applied. On failure a [`ServiceCacheFailed`] is
    /// published and the rollback error returned.
    pub async fn add_service(&self, request: &ServiceAddRequested) -> LifecycleResult<()> {
        let identity = request.identity.clone();

        if self.is_cached_with(&identity, &request.client_id).await? {
            debug!(identity = %identity, client_id = %request.client_id, "Service already cached");
            return self.announce_cached(request).await;
        }

        let guard = self.tenant_guard(&identity.tenant_id).await;
        let store = self.store.clone();
        let owned = request.clone();
        let outcome = tokio::spawn(async move {
            let _tenant = guard.lock().await;
            let mut tx = CacheTransaction::new(store);
            match tx.add(&owned).await {
                Ok(()) => Ok(()),
                Err((step, e)) => {
                    tx.rollback().await;
                    Err(LifecycleError::TransactionRollback {
                        step: step.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        })
        .await
        .unwrap_or_else(|e| {
            Err(LifecycleError::TransactionRollback {
                step: "transaction".to_string(),
                reason: e.to_string(),
            })
        });

        match outcome {
            Ok(()) => {
                info!(identity = %identity, client_id = %request.client_id, "Service cached");
                self.announce_cached(request).await
            }
            Err(LifecycleError::TransactionRollback { step, reason }) => {
                warn!(identity = %identity, step = %step, reason = %reason, "Cache transaction rolled back");
                let failed = LifecycleEvent::ServiceCacheFailed(ServiceCacheFailed {
                    identity,
                    step: step.clone(),
                    error: reason.clone(),
                });
                self.bus.emit(failed, SOURCE, true).await?;
                Err(LifecycleError::TransactionRollback { step, reason })
            }
            Err(other) => Err(other),
        }
    }

    async fn announce_cached(&self, request: &ServiceAddRequested) -> LifecycleResult<()> {
        let cached = LifecycleEvent::ServiceCached(ServiceCached {
            identity: request.identity.clone(),
            client_id: request.client_id.clone(),
            config: request.config.clone(),
        });
        self.bus.emit(cached, SOURCE, true).await
    }

    async fn is_cached_with(&self, identity: &ServiceIdentity, client_id: &ClientId) -> LifecycleResult<bool> {
        let current = self.client_id_for(identity).await?;
        Ok(current.as_ref() == Some(client_id) && self.get_service(identity).await?.is_some())
    }

    /// Replace session, tools and tool status with the live ones
    pub async fn store_connection(&self, event: &ServiceConnected) -> LifecycleResult<()> {
        let identity = &event.identity;
        let key = identity.key();
        let guard = self.tenant_guard(&identity.tenant_id).await;
        let _tenant = guard.lock().await;

        if self.get_service(identity).await?.is_none() {
            debug!(identity = %identity, "Connected service is no longer cached");
            return Ok(());
        }

        for collection in [
            collections::SERVICE_TOOLS,
            collections::SERVICE_SESSIONS,
            collections::TOOL_STATUS,
        ] {
            self.store.delete(collection, &key).await?;
        }

        let now = Utc::now();
        let status: ToolStatusMap = event
            .tools
            .iter()
            .map(|tool| {
                (
                    tool.name.clone(),
                    ToolStatus {
                        available: true,
                        updated_at: now,
                    },
                )
            })
            .collect();

        self.store
            .put_json(collections::SERVICE_SESSIONS, &key, &event.session)
            .await?;
        self.store
            .put_json(collections::SERVICE_TOOLS, &key, &event.tools)
            .await?;
        self.store.put_json(collections::TOOL_STATUS, &key, &status).await?;
        debug!(identity = %identity, tools = event.tools.len(), "Tool cache refreshed");
        Ok(())
    }

    /// Delete every cache record of an identity
    pub async fn purge_service(&self, identity: &ServiceIdentity) -> LifecycleResult<()> {
        let key = identity.key();
        let guard = self.tenant_guard(&identity.tenant_id).await;
        let _tenant = guard.lock().await;

        if let Some(client_id) = self.client_id_for(identity).await? {
            self.store
                .delete(collections::CLIENT_CONFIGS, client_id.as_str())
                .await?;
            let mut clients = self.tenant_clients(&identity.tenant_id).await?;
            clients.retain(|c| c != &client_id);
            if clients.is_empty() {
                self.store
                    .delete(collections::TENANT_CLIENTS, &identity.tenant_id)
                    .await?;
            } else {
                self.store
                    .put_json(collections::TENANT_CLIENTS, &identity.tenant_id, &clients)
                    .await?;
            }
        }

        for collection in [
            collections::SERVICES,
            collections::SERVICE_CLIENTS,
            collections::SERVICE_SESSIONS,
            collections::SERVICE_TOOLS,
            collections::TOOL_STATUS,
        ] {
            self.store.delete(collection, &key).await?;
        }
        info!(identity = %identity, "Service purged from cache");
        Ok(())
    }

    /// Mark one tool available or not
    pub async fn set_tool_available(
        &self,
        identity: &ServiceIdentity,
        tool: &str,
        available: bool,
    ) -> LifecycleResult<bool> {
        let key = identity.key();
        let guard = self.tenant_guard(&identity.tenant_id).await;
        let _tenant = guard.lock().await;

        let mut status = self.tool_status(identity).await?;
        let Some(entry) = status.get_mut(tool) else {
            return Ok(false);
        };
        entry.available = available;
        entry.updated_at = Utc::now();
        self.store.put_json(collections::TOOL_STATUS, &key, &status).await?;
        Ok(true)
    }

    /// Service record of an identity
    pub async fn get_service(&self, identity: &ServiceIdentity) -> LifecycleResult<Option<ServiceRecord>> {
        Ok(self.store.get_json(collections::SERVICES, &identity.key()).await?)
    }

    /// Every service record of a tenant, ordered by service name
    ///
    /// Walks the tenant's client list, so other tenants are never read.
    pub async fn list_services(&self, tenant_id: &str) -> LifecycleResult<Vec<ServiceRecord>> {
        let mut services = BTreeMap::new();
        for client_id in self.tenant_clients(tenant_id).await? {
            let Some(client) = self.client_config(&client_id).await? else {
                continue;
            };
            if let Some(record) = self.get_service(&client.identity).await? {
                services.insert(record.identity.service_name.clone(), record);
            }
        }
        Ok(services.into_values().collect())
    }

    /// Client ids registered for a tenant
    pub async fn tenant_clients(&self, tenant_id: &str) -> LifecycleResult<Vec<ClientId>> {
        Ok(self
            .store
            .get_json(collections::TENANT_CLIENTS, tenant_id)
            .await?
            .unwrap_or_default())
    }

    /// Client id serving an identity
    pub async fn client_id_for(&self, identity: &ServiceIdentity) -> LifecycleResult<Option<ClientId>> {
        Ok(self
            .store
            .get_json(collections::SERVICE_CLIENTS, &identity.key())
            .await?)
    }

    /// Stored client config
    pub async fn client_config(&self, client_id: &ClientId) -> LifecycleResult<Option<ClientConfigRecord>> {
        Ok(self
            .store
            .get_json(collections::CLIENT_CONFIGS, client_id.as_str())
            .await?)
    }

    /// Live session of an identity
    pub async fn session(&self, identity: &ServiceIdentity) -> LifecycleResult<Option<SessionInfo>> {
        Ok(self
            .store
            .get_json(collections::SERVICE_SESSIONS, &identity.key())
            .await?)
    }

    /// Per-tool status of an identity
    pub async fn tool_status(&self, identity: &ServiceIdentity) -> LifecycleResult<ToolStatusMap> {
        Ok(self
            .store
            .get_json(collections::TOOL_STATUS, &identity.key())
            .await?
            .unwrap_or_default())
    }

    /// Tools currently marked available, in advertised order
    pub async fn list_tools(&self, identity: &ServiceIdentity) -> LifecycleResult<Vec<ToolInfo>> {
        let tools: Vec<ToolInfo> = self
            .store
            .get_json(collections::SERVICE_TOOLS, &identity.key())
            .await?
            .unwrap_or_default();
        let status = self.tool_status(identity).await?;
        Ok(tools
            .into_iter()
            .filter(|tool| status.get(&tool.name).is_some_and(|s| s.available))
            .collect())
    }
}

#[async_trait]
impl EventHandler for CacheManager {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn handle(&self, envelope: &EventEnvelope) -> LifecycleResult<()> {
        match &envelope.event {
            LifecycleEvent::ServiceAddRequested(request) => match self.add_service(request).await {
                // The failure is already published as a fact.
                Err(LifecycleError::TransactionRollback { .. }) => Ok(()),
                other => other,
            },
            LifecycleEvent::ServiceConnected(event) => self.store_connection(event).await,
            LifecycleEvent::ServiceRemoveRequested(event) => self.purge_service(&event.identity).await,
            _ => Ok(()),
        }
    }
}
