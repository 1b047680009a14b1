// Copyright 2025 Cowboy AI, LLC.

//! Shared key-value store abstraction
//!
//! Every piece of shared state (connection state, metadata, cache records,
//! the event queue, consumer offsets, dedup entries and leases) lives in a
//! named collection of a [`KeyValueStore`]. Components never share raw maps;
//! they go through this interface by composite key.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Collection names used across the crate
pub mod collections {
    /// Current connection state per identity
    pub const SERVICE_STATE: &str = "service_state";
    /// Operational metadata per identity
    pub const SERVICE_METADATA: &str = "service_metadata";
    /// Service records per identity
    pub const SERVICES: &str = "services";
    /// Tenant to client id list
    pub const TENANT_CLIENTS: &str = "tenant_clients";
    /// Client configuration per client id
    pub const CLIENT_CONFIGS: &str = "client_configs";
    /// Identity to client id
    pub const SERVICE_CLIENTS: &str = "service_clients";
    /// Live session per identity
    pub const SERVICE_SESSIONS: &str = "service_sessions";
    /// Tool list per identity
    pub const SERVICE_TOOLS: &str = "service_tools";
    /// Per-tool availability per identity
    pub const TOOL_STATUS: &str = "tool_status";
    /// Durable event queue
    pub const EVENT_QUEUE: &str = "event_queue";
    /// Consumer offsets
    pub const EVENT_OFFSETS: &str = "event_offsets";
    /// Dedup entries
    pub const EVENT_DEDUP: &str = "event_dedup";
    /// Advisory leases
    pub const LEASES: &str = "leases";
}

/// Errors raised by a key-value store backend
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend rejected the operation
    #[error("Storage error: {0}")]
    Storage(String),

    /// Key or collection name not accepted by the backend
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    /// Whether the operation may succeed if retried
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Storage(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Key-value store over named collections
#[async_trait]
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    /// Read one value
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write one value, replacing any existing one
    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Delete one value, returning whether it existed
    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError>;

    /// List every key of a collection
    async fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError>;

    /// Read several values, preserving the order of `keys`
    async fn get_many(
        &self,
        collection: &str,
        keys: &[String],
    ) -> Result<Vec<Option<Value>>, StoreError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(collection, key).await?);
        }
        Ok(values)
    }
}

/// Typed helpers over any [`KeyValueStore`]
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Read and decode a value
    async fn get_json<T>(&self, collection: &str, key: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(collection, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a value
    async fn put_json<T>(&self, collection: &str, key: &str, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(value)?;
        self.put(collection, key, value).await
    }

    /// Read and decode every value of a collection, skipping undecodable entries
    async fn values_json<T>(&self, collection: &str) -> Result<Vec<(String, T)>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        let keys = self.keys(collection).await?;
        let values = self.get_many(collection, &keys).await?;
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| {
                let value = value?;
                match serde_json::from_value(value) {
                    Ok(decoded) => Some((key, decoded)),
                    Err(e) => {
                        tracing::warn!(collection, key = %key, error = %e, "Skipping undecodable entry");
                        None
                    }
                }
            })
            .collect())
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// In-memory store for tests and single-process deployments
#[derive(Debug, Clone, Default)]
pub struct InMemoryKeyValueStore {
    collections: Arc<RwLock<HashMap<String, BTreeMap<String, Value>>>>,
}

impl InMemoryKeyValueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a collection
    pub async fn len(&self, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(collection).map_or(0, |c| c.len())
    }

    /// Whether the whole store is empty
    pub async fn is_empty(&self) -> bool {
        let collections = self.collections.read().await;
        collections.values().all(|c| c.is_empty())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty key".to_string()));
        }
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        let mut collections = self.collections.write().await;
        Ok(collections
            .get_mut(collection)
            .map(|entries| entries.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_many(
        &self,
        collection: &str,
        keys: &[String],
    ) -> Result<Vec<Option<Value>>, StoreError> {
        let collections = self.collections.read().await;
        let entries = collections.get(collection);
        Ok(keys
            .iter()
            .map(|key| entries.and_then(|e| e.get(key)).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        latency_ms: u64,
    }

    #[tokio::test]
    async fn test_crud_operations() {
        let store = InMemoryKeyValueStore::new();

        assert!(store.get("c", "k").await.unwrap().is_none());
        store.put("c", "k", serde_json::json!(1)).await.unwrap();
        assert_eq!(store.get("c", "k").await.unwrap(), Some(serde_json::json!(1)));

        assert!(store.delete("c", "k").await.unwrap());
        assert!(!store.delete("c", "k").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let store = InMemoryKeyValueStore::new();
        store.put("a", "k", serde_json::json!("a")).await.unwrap();
        store.put("b", "k", serde_json::json!("b")).await.unwrap();

        assert_eq!(store.keys("a").await.unwrap(), vec!["k".to_string()]);
        assert_eq!(store.get("b", "k").await.unwrap(), Some(serde_json::json!("b")));
        assert_eq!(store.len("a").await, 1);
    }

    #[tokio::test]
    async fn test_get_many_preserves_order() {
        let store = InMemoryKeyValueStore::new();
        store.put("c", "2", serde_json::json!(2)).await.unwrap();
        store.put("c", "1", serde_json::json!(1)).await.unwrap();

        let keys = vec!["1".to_string(), "missing".to_string(), "2".to_string()];
        let values = store.get_many("c", &keys).await.unwrap();
        assert_eq!(
            values,
            vec![Some(serde_json::json!(1)), None, Some(serde_json::json!(2))]
        );
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        let store = InMemoryKeyValueStore::new();
        let probe = Probe {
            name: "weather".to_string(),
            latency_ms: 12,
        };
        store.put_json("probes", "weather", &probe).await.unwrap();

        let loaded: Option<Probe> = store.get_json("probes", "weather").await.unwrap();
        assert_eq!(loaded, Some(probe.clone()));

        store.put("probes", "broken", serde_json::json!("nope")).await.unwrap();
        let all: Vec<(String, Probe)> = store.values_json("probes").await.unwrap();
        assert_eq!(all, vec![("weather".to_string(), probe)]);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = InMemoryKeyValueStore::new();
        let err = store.put("c", "", serde_json::json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
