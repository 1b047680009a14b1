// Copyright 2025 Cowboy AI, LLC.

//! NATS JetStream KV backed [`KeyValueStore`]
//!
//! Each collection maps to one KV bucket named `{bucket_prefix}_{collection}`.
//! NATS restricts keys to `[-/_=.a-zA-Z0-9]`, so keys are escaped: bytes
//! outside `[-_a-zA-Z0-9]` become `=XX` (upper-case hex).

use crate::infrastructure::kv_store::{KeyValueStore, StoreError};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Configuration for the NATS KV store
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NatsKvConfig {
    /// NATS server URL
    pub url: String,
    /// Prefix for every bucket name
    pub bucket_prefix: String,
    /// History depth kept per key
    pub history: i64,
    /// Max age of entries in seconds (0 = keep forever)
    pub max_age_secs: u64,
    /// Whether buckets are file backed (memory otherwise)
    pub file_storage: bool,
}

impl Default for NatsKvConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            bucket_prefix: "lifecycle".to_string(),
            history: 1,
            max_age_secs: 0,
            file_storage: true,
        }
    }
}

/// Key-value store on JetStream KV buckets
#[derive(Debug, Clone)]
pub struct NatsKvStore {
    jetstream: jetstream::Context,
    config: NatsKvConfig,
    buckets: Arc<RwLock<HashMap<String, kv::Store>>>,
}

impl NatsKvStore {
    /// Connect to NATS and build a store
    pub async fn connect(config: NatsKvConfig) -> Result<Self, StoreError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    /// Build a store over an existing client
    pub fn with_client(client: async_nats::Client, config: NatsKvConfig) -> Self {
        Self {
            jetstream: jetstream::new(client),
            config,
            buckets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn bucket_name(&self, collection: &str) -> String {
        format!("{}_{}", self.config.bucket_prefix, collection)
    }

    /// Get the bucket for a collection, creating it on first use
    async fn bucket(&self, collection: &str) -> Result<kv::Store, StoreError> {
        {
            let buckets = self.buckets.read().await;
            if let Some(store) = buckets.get(collection) {
                return Ok(store.clone());
            }
        }

        let mut buckets = self.buckets.write().await;
        if let Some(store) = buckets.get(collection) {
            return Ok(store.clone());
        }

        let bucket = self.bucket_name(collection);
        let store = match self.jetstream.get_key_value(&bucket).await {
            Ok(store) => store,
            Err(_) => self
                .jetstream
                .create_key_value(kv::Config {
                    bucket: bucket.clone(),
                    description: format!("lifecycle collection {collection}"),
                    history: self.config.history,
                    max_age: Duration::from_secs(self.config.max_age_secs),
                    storage: if self.config.file_storage {
                        jetstream::stream::StorageType::File
                    } else {
                        jetstream::stream::StorageType::Memory
                    },
                    ..Default::default()
                })
                .await
                .map_err(|e| StoreError::Connection(format!("Failed to create bucket {bucket}: {e}")))?,
        };

        debug!(bucket = %bucket, "Opened KV bucket");
        buckets.insert(collection.to_string(), store.clone());
        Ok(store)
    }
}

/// Escape a key into the NATS key alphabet
pub fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("={byte:02X}"));
        }
    }
    encoded
}

/// Reverse [`encode_key`]
pub fn decode_key(encoded: &str) -> Result<String, StoreError> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            let hex = encoded
                .get(i + 1..i + 3)
                .ok_or_else(|| StoreError::InvalidKey(encoded.to_string()))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| StoreError::InvalidKey(encoded.to_string()))?;
            decoded.push(byte);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).map_err(|_| StoreError::InvalidKey(encoded.to_string()))
}

#[async_trait]
impl KeyValueStore for NatsKvStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let bucket = self.bucket(collection).await?;
        match bucket.get(encode_key(key)).await {
            Ok(Some(bytes)) if !bytes.is_empty() => Ok(Some(serde_json::from_slice(&bytes)?)),
            Ok(_) => Ok(None),
            Err(e) => Err(StoreError::Storage(e.to_string())),
        }
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty key".to_string()));
        }
        let bucket = self.bucket(collection).await?;
        let payload = serde_json::to_vec(&value)?;
        bucket
            .put(encode_key(key), bytes::Bytes::from(payload))
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        let existed = self.get(collection, key).await?.is_some();
        if existed {
            let bucket = self.bucket(collection).await?;
            bucket
                .delete(encode_key(key))
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;
        }
        Ok(existed)
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let bucket = self.bucket(collection).await?;
        let mut stream = bucket
            .keys()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let mut keys = Vec::new();
        while let Some(key) = stream.next().await {
            let key = key.map_err(|e| StoreError::Storage(e.to_string()))?;
            keys.push(decode_key(&key)?);
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsKvConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.bucket_prefix, "lifecycle");
        assert_eq!(config.history, 1);
    }

    #[test]
    fn test_key_encoding_round_trip() {
        for key in ["default::weather", "00000000000000000042", "tenant one/x", "a=b"] {
            let encoded = encode_key(key);
            assert!(encoded
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'='));
            assert_eq!(decode_key(&encoded).unwrap(), key);
        }
        assert_eq!(encode_key("default::weather"), "default=3A=3Aweather");
    }

    #[test]
    fn test_invalid_encoded_key() {
        assert!(decode_key("abc=4").is_err());
        assert!(decode_key("abc=ZZ").is_err());
    }
}
