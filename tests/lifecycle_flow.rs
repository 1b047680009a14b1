// Copyright 2025 Cowboy AI, LLC.

//! End-to-end flows through the wired runtime

mod common;

use cim_lifecycle::{
    collections, ClientError, EventType, InMemoryKeyValueStore, LifecycleError, ServiceConfig,
    ServiceConnectionState::*, ServiceDefinitions, ServiceIdentity,
};
use common::*;
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn add_service_reaches_healthy() {
    let client = ScriptedClient::new();
    client.connect_ok(&["forecast", "alerts"]);
    let (runtime, recorder) =
        runtime_with(fast_config("node-a"), Arc::new(InMemoryKeyValueStore::new()), client.clone()).await;
    runtime.start();

    let added = runtime
        .application()
        .add_service("default", "weather", weather_config(), WAIT)
        .await
        .unwrap();
    assert_eq!(added.state, Some(Healthy));
    assert!(added.is_settled());

    let transitions = recorder.transitions();
    assert_eq!(
        transitions[..2].to_vec(),
        vec![(None, Initializing), (Some(Initializing), Healthy)]
    );

    let tools: Vec<String> = runtime
        .application()
        .list_tools(&weather())
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(tools, vec!["forecast".to_string(), "alerts".to_string()]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn same_config_yields_same_client_id() {
    let client = ScriptedClient::new();
    let (runtime, recorder) =
        runtime_with(fast_config("node-a"), Arc::new(InMemoryKeyValueStore::new()), client.clone()).await;
    runtime.start();

    let app = runtime.application();
    let first = app.add_service("default", "weather", weather_config(), WAIT).await.unwrap();
    let second = app.add_service("default", "weather", weather_config(), WAIT).await.unwrap();
    assert_eq!(first.client_id, second.client_id);
    runtime.bus().wait_idle().await;

    // The repeated add is absorbed: one record, one INITIALIZING.
    assert_eq!(app.list_services("default").await.unwrap().len(), 1);
    let initializations = recorder
        .transitions()
        .into_iter()
        .filter(|(_, to)| *to == Initializing)
        .count();
    assert_eq!(initializations, 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn health_failures_degrade_then_recover() {
    let client = ScriptedClient::new();
    client.ping(Err(ClientError::Timeout(100)));
    client.ping(Err(ClientError::Timeout(100)));
    let (runtime, recorder) =
        runtime_with(fast_config("node-a"), Arc::new(InMemoryKeyValueStore::new()), client.clone()).await;
    runtime.start();

    runtime
        .application()
        .add_service("default", "weather", weather_config(), WAIT)
        .await
        .unwrap();

    let recovered = eventually(WAIT, || async {
        recorder.transitions().contains(&(Some(Reconnecting), Healthy))
    })
    .await;
    assert!(recovered, "transitions: {:?}", recorder.transitions());

    assert_eq!(
        recorder.transitions()[..5].to_vec(),
        vec![
            (None, Initializing),
            (Some(Initializing), Healthy),
            (Some(Healthy), Warning),
            (Some(Warning), Reconnecting),
            (Some(Reconnecting), Healthy),
        ]
    );
    assert!(recorder.types().contains(&EventType::ReconnectionRequested));
    assert!(client.connects() >= 2);

    let meta = runtime.application().get_metadata(&weather()).await.unwrap().unwrap();
    assert_eq!(meta.reconnect_attempts, 0);
    assert!(meta.next_retry_time.is_none());

    runtime.shutdown().await;
}

#[tokio::test]
async fn refused_connects_exhaust_retries() {
    let client = ScriptedClient::new();
    for _ in 0..20 {
        client.connect_refused();
    }
    let mut config = fast_config("node-a");
    config.reconnection.max_retries = 2;
    let (runtime, recorder) =
        runtime_with(config, Arc::new(InMemoryKeyValueStore::new()), client.clone()).await;
    runtime.start();

    runtime
        .application()
        .add_service("default", "weather", weather_config(), Duration::ZERO)
        .await
        .unwrap();

    let gave_up = eventually(WAIT, || async {
        runtime.application().get_state(&weather()).await.unwrap() == Some(Unreachable)
    })
    .await;
    assert!(gave_up, "transitions: {:?}", recorder.transitions());
    assert!(recorder.types().contains(&EventType::ServiceTimeout));

    runtime.shutdown().await;
}

#[tokio::test]
async fn slow_final_retry_is_honoured() {
    let client = ScriptedClient::new();
    client.connect_refused();
    client.connect_ok_after(Duration::from_millis(300), &["forecast"]);
    let mut config = fast_config("node-a");
    config.reconnection.max_retries = 1;
    config.reconnection.base_delay = Duration::from_millis(50);
    config.reconnection.max_delay = Duration::from_secs(1);
    config.connection.connect_timeout = Duration::from_secs(1);
    let (runtime, recorder) =
        runtime_with(config, Arc::new(InMemoryKeyValueStore::new()), client.clone()).await;
    runtime.start();

    runtime
        .application()
        .add_service("default", "weather", weather_config(), Duration::ZERO)
        .await
        .unwrap();

    let recovered = eventually(WAIT, || async {
        runtime.application().get_state(&weather()).await.unwrap() == Some(Healthy)
    })
    .await;
    assert!(recovered, "transitions: {:?}", recorder.transitions());
    assert_eq!(client.connects(), 2);
    assert!(!recorder.types().contains(&EventType::ServiceTimeout));
    assert!(runtime.cache().session(&weather()).await.unwrap().is_some());

    runtime.shutdown().await;
}

#[tokio::test]
async fn giving_up_leaves_no_session_behind() {
    let client = ScriptedClient::new();
    client.connect_refused();
    client.connect_ok_after(Duration::from_secs(5), &["forecast"]);
    let mut config = fast_config("node-a");
    config.reconnection.max_retries = 1;
    config.reconnection.base_delay = Duration::from_millis(20);
    config.reconnection.max_delay = Duration::from_millis(40);
    config.connection.connect_timeout = Duration::from_millis(200);
    let (runtime, recorder) =
        runtime_with(config, Arc::new(InMemoryKeyValueStore::new()), client.clone()).await;
    runtime.start();

    runtime
        .application()
        .add_service("default", "weather", weather_config(), Duration::ZERO)
        .await
        .unwrap();

    let gave_up = eventually(WAIT, || async {
        runtime.application().get_state(&weather()).await.unwrap() == Some(Unreachable)
    })
    .await;
    assert!(gave_up, "transitions: {:?}", recorder.transitions());
    let idle = eventually(WAIT, || async { !runtime.connection().is_connecting(&weather()) }).await;
    assert!(idle);

    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.bus().wait_idle().await;
    assert_eq!(runtime.application().get_state(&weather()).await.unwrap(), Some(Unreachable));
    assert!(runtime.cache().session(&weather()).await.unwrap().is_none());
    assert!(!recorder.types().contains(&EventType::ServiceConnected));

    runtime.shutdown().await;
}

#[tokio::test]
async fn changed_config_replaces_service() {
    let client = ScriptedClient::new();
    let store = Arc::new(InMemoryKeyValueStore::new());
    let (runtime, _recorder) = runtime_with(fast_config("node-a"), store.clone(), client.clone()).await;
    runtime.start();
    let app = runtime.application();

    let first = app.add_service("default", "weather", weather_config(), WAIT).await.unwrap();
    let moved = ServiceConfig::remote("http://localhost:9000/mcp");
    let second = app.add_service("default", "weather", moved.clone(), WAIT).await.unwrap();
    assert_ne!(first.client_id, second.client_id);
    assert_eq!(second.state, Some(Healthy));

    let metadata = app.get_metadata(&weather()).await.unwrap().unwrap();
    assert_eq!(metadata.client_id, Some(second.client_id.clone()));
    assert_eq!(metadata.config, moved);
    assert_eq!(store.len(collections::CLIENT_CONFIGS).await, 1);
    assert_eq!(
        runtime.cache().tenant_clients("default").await.unwrap(),
        vec![second.client_id.clone()]
    );

    app.disconnect_service(&weather(), "maintenance").await.unwrap();
    runtime.bus().wait_idle().await;
    app.remove_service(&weather()).await.unwrap();
    runtime.bus().wait_idle().await;
    assert_eq!(store.len(collections::CLIENT_CONFIGS).await, 0);
    assert!(app.list_services("default").await.unwrap().is_empty());

    runtime.shutdown().await;
}

#[tokio::test]
async fn disconnect_then_remove_forgets_service() {
    let client = ScriptedClient::new();
    client.connect_ok(&["forecast"]);
    let (runtime, recorder) =
        runtime_with(fast_config("node-a"), Arc::new(InMemoryKeyValueStore::new()), client.clone()).await;
    runtime.start();
    let app = runtime.application();
    app.add_service("default", "weather", weather_config(), WAIT).await.unwrap();
    recorder.clear();

    app.disconnect_service(&weather(), "maintenance").await.unwrap();
    runtime.bus().wait_idle().await;
    assert_eq!(
        recorder.transitions(),
        vec![(Some(Healthy), Disconnecting), (Some(Disconnecting), Disconnected)]
    );
    assert_eq!(client.disconnect_calls.load(Ordering::SeqCst), 1);
    assert!(app.list_tools(&weather()).await.unwrap().is_empty());
    assert!(!runtime.health().is_monitoring(&weather()));

    app.remove_service(&weather()).await.unwrap();
    runtime.bus().wait_idle().await;
    assert_eq!(app.get_state(&weather()).await.unwrap(), None);
    assert!(app.list_services("default").await.unwrap().is_empty());
    assert!(app.remove_service(&weather()).await.unwrap_err().is_not_found());

    runtime.shutdown().await;
}

#[tokio::test]
async fn restart_reconnects() {
    let client = ScriptedClient::new();
    let (runtime, recorder) =
        runtime_with(fast_config("node-a"), Arc::new(InMemoryKeyValueStore::new()), client.clone()).await;
    runtime.start();
    let app = runtime.application();
    app.add_service("default", "weather", weather_config(), WAIT).await.unwrap();
    recorder.clear();

    app.restart_service(&weather()).await.unwrap();
    let back = eventually(WAIT, || async {
        recorder.transitions() == vec![(Some(Healthy), Startup), (Some(Startup), Healthy)]
            && client.connects() == 2
    })
    .await;
    assert!(back, "transitions: {:?}", recorder.transitions());

    runtime.shutdown().await;
}

#[tokio::test]
async fn check_health_reports_synchronously() {
    let client = ScriptedClient::new();
    let mut config = fast_config("node-a");
    // Keep the background poll out of the way of the scripted ping.
    config.health.healthy_interval = Duration::from_secs(60);
    let (runtime, _recorder) =
        runtime_with(config, Arc::new(InMemoryKeyValueStore::new()), client.clone()).await;
    runtime.start();
    let app = runtime.application();
    app.add_service("default", "weather", weather_config(), WAIT).await.unwrap();

    client.ping(Err(ClientError::ConnectionRefused("down".to_string())));
    let result = app.check_health(&weather()).await.unwrap();
    assert!(!result.success);
    assert_eq!(app.get_state(&weather()).await.unwrap(), Some(Warning));
    let meta = app.get_metadata(&weather()).await.unwrap().unwrap();
    assert_eq!(meta.consecutive_failures, 1);

    let stranger = ServiceIdentity::new("default", "ghost").unwrap();
    assert!(app.check_health(&stranger).await.unwrap_err().is_not_found());

    runtime.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_synchronously() {
    let client = ScriptedClient::new();
    let (runtime, recorder) =
        runtime_with(fast_config("node-a"), Arc::new(InMemoryKeyValueStore::new()), client).await;
    runtime.start();
    let app = runtime.application();

    let no_target = app
        .add_service("default", "weather", ServiceConfig::default(), WAIT)
        .await
        .unwrap_err();
    assert!(no_target.is_validation_error());

    let empty_name = app
        .add_service("default", " ", weather_config(), WAIT)
        .await
        .unwrap_err();
    assert!(matches!(empty_name, LifecycleError::Validation(_)));

    let bad_url = app
        .add_service("default", "weather", ServiceConfig::remote("localhost"), WAIT)
        .await
        .unwrap_err();
    assert!(bad_url.is_validation_error());

    runtime.bus().wait_idle().await;
    assert!(recorder.events().is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn tenants_are_isolated() {
    let client = ScriptedClient::new();
    let (runtime, _recorder) =
        runtime_with(fast_config("node-a"), Arc::new(InMemoryKeyValueStore::new()), client).await;
    runtime.start();
    let app = runtime.application();

    let mut definitions = ServiceDefinitions::new();
    definitions.insert("weather".to_string(), weather_config());
    definitions.insert(
        "search".to_string(),
        ServiceConfig::command("npx", vec!["search-server".to_string()]),
    );
    definitions.insert("broken".to_string(), ServiceConfig::default());

    let outcomes = app.add_services("alpha", definitions, WAIT).await;
    assert!(outcomes["weather"].is_ok());
    assert!(outcomes["search"].is_ok());
    assert!(outcomes["broken"].as_ref().unwrap_err().is_validation_error());

    app.add_service("beta", "weather", weather_config(), WAIT).await.unwrap();

    let alpha: Vec<String> = app
        .list_services("alpha")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.identity.service_name)
        .collect();
    assert_eq!(alpha.len(), 2);
    assert!(alpha.contains(&"search".to_string()));
    assert_eq!(app.list_services("beta").await.unwrap().len(), 1);

    let alpha_weather = ServiceIdentity::new("alpha", "weather").unwrap();
    let beta_weather = ServiceIdentity::new("beta", "weather").unwrap();
    let alpha_id = runtime.cache().client_id_for(&alpha_weather).await.unwrap();
    let beta_id = runtime.cache().client_id_for(&beta_weather).await.unwrap();
    assert_ne!(alpha_id, beta_id);

    runtime.shutdown().await;
}
