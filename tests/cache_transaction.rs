// Copyright 2025 Cowboy AI, LLC.

//! All-or-nothing caching through the wired runtime

mod common;

use async_trait::async_trait;
use cim_lifecycle::{
    collections, EventType, InMemoryKeyValueStore, KeyValueStore, LifecycleEvent,
    LifecycleRuntime, ServiceConfig, ServiceIdentity, StoreError,
};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store that rejects writes to one collection once armed
#[derive(Debug)]
struct FailingStore {
    inner: InMemoryKeyValueStore,
    collection: &'static str,
    armed: AtomicBool,
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(collection, key).await
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        if collection == self.collection && self.armed.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("injected failure".to_string()));
        }
        self.inner.put(collection, key, value).await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(collection, key).await
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        self.inner.keys(collection).await
    }
}

async fn failing_runtime() -> (LifecycleRuntime, Arc<Recorder>, Arc<FailingStore>) {
    let store = Arc::new(FailingStore {
        inner: InMemoryKeyValueStore::new(),
        collection: collections::CLIENT_CONFIGS,
        armed: AtomicBool::new(false),
    });
    let runtime = LifecycleRuntime::builder()
        .config(fast_config("node-a"))
        .store(store.clone())
        .client(ScriptedClient::new())
        .build()
        .await
        .unwrap();
    let recorder = Recorder::new();
    runtime
        .bus()
        .subscribe_all(&EventType::ALL, recorder.clone(), i32::MIN)
        .await;
    runtime.start();
    (runtime, recorder, store)
}

#[tokio::test]
async fn failed_client_config_write_leaves_no_residue() {
    let (runtime, recorder, store) = failing_runtime().await;
    let app = runtime.application();

    let search = app
        .add_service(
            "default",
            "search",
            ServiceConfig::command("npx", vec!["search-server".to_string()]),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    let search_client = search.client_id.clone();

    store.armed.store(true, Ordering::SeqCst);
    let weather = app
        .add_service("default", "weather", weather_config(), Duration::from_millis(100))
        .await
        .unwrap();
    runtime.bus().wait_idle().await;

    // The wait expires without an error; the best-known state is "absent".
    assert_eq!(weather.state, None);

    let failure = recorder.events().into_iter().find_map(|event| match event {
        LifecycleEvent::ServiceCacheFailed(e) => Some(e),
        _ => None,
    });
    let failure = failure.expect("a cache failure fact");
    assert_eq!(failure.identity, ServiceIdentity::new("default", "weather").unwrap());
    assert_eq!(failure.step, "client_config");

    let weather_id = ServiceIdentity::new("default", "weather").unwrap();
    let cache = runtime.cache();
    assert!(cache.get_service(&weather_id).await.unwrap().is_none());
    assert!(cache.client_id_for(&weather_id).await.unwrap().is_none());
    assert!(cache.client_config(&weather.client_id).await.unwrap().is_none());
    assert_eq!(cache.tenant_clients("default").await.unwrap(), vec![search_client]);
    assert_eq!(store.inner.len(collections::SERVICES).await, 1);
    assert!(runtime.lifecycle().get_state(&weather_id).await.unwrap().is_none());

    runtime.shutdown().await;
}

#[tokio::test]
async fn failed_first_add_for_tenant_removes_mapping() {
    let (runtime, recorder, store) = failing_runtime().await;
    store.armed.store(true, Ordering::SeqCst);

    runtime
        .application()
        .add_service("default", "weather", weather_config(), Duration::ZERO)
        .await
        .unwrap();
    runtime.bus().wait_idle().await;

    assert!(recorder.types().contains(&EventType::ServiceCacheFailed));
    assert!(!recorder.types().contains(&EventType::ServiceCached));
    for collection in [
        collections::SERVICES,
        collections::TENANT_CLIENTS,
        collections::CLIENT_CONFIGS,
        collections::SERVICE_CLIENTS,
        collections::SERVICE_STATE,
    ] {
        assert_eq!(store.inner.len(collection).await, 0, "{collection} not empty");
    }

    runtime.shutdown().await;
}
