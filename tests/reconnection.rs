// Copyright 2025 Cowboy AI, LLC.

//! Backoff policy and lease-guarded scheduling

mod common;

use cim_lifecycle::{
    BackoffPolicy, EventStore, InMemoryKeyValueStore, KvEventStore, ReconnectionConfig,
    ReconnectionScheduler,
};
use common::*;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use test_case::test_case;

fn seconds_policy() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
}

#[test_case(0, 1_000 ; "first retry uses base delay")]
#[test_case(1, 2_000 ; "second retry doubles")]
#[test_case(3, 8_000 ; "fourth retry")]
#[test_case(5, 32_000 ; "last unclamped step")]
#[test_case(6, 60_000 ; "clamped at max")]
#[test_case(10, 60_000 ; "well past max")]
#[test_case(64, 60_000 ; "shift overflow clamps")]
fn backoff_table(retry_count: u32, expected_ms: u64) {
    assert_eq!(seconds_policy().delay(retry_count), Duration::from_millis(expected_ms));
}

#[test]
fn backoff_from_config_defaults() {
    let policy = BackoffPolicy::from(&ReconnectionConfig::default());
    assert_eq!(policy.delay(0), Duration::from_secs(1));
    assert_eq!(policy.delay(10), Duration::from_secs(60));
}

proptest! {
    #[test]
    fn backoff_is_monotone_and_clamped(
        base_ms in 1u64..10_000,
        extra_ms in 0u64..600_000,
        retry in 0u32..80,
    ) {
        let base = Duration::from_millis(base_ms);
        let max = base + Duration::from_millis(extra_ms);
        let policy = BackoffPolicy::new(base, max);

        prop_assert_eq!(policy.delay(0), base);
        prop_assert!(policy.delay(retry) <= max);
        prop_assert!(policy.delay(retry) <= policy.delay(retry + 1));
    }
}

fn scheduler_config() -> ReconnectionConfig {
    ReconnectionConfig {
        scan_interval: Duration::from_millis(10),
        lease_ttl: Duration::from_millis(200),
        ..ReconnectionConfig::default()
    }
}

#[tokio::test]
async fn second_scheduler_waits_for_the_lease() {
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let leases: Arc<dyn EventStore> = Arc::new(KvEventStore::new(kv.clone()));
    let (node_a, _) = runtime_with(fast_config("node-a"), kv.clone(), ScriptedClient::new()).await;

    let first = ReconnectionScheduler::new(
        node_a.lifecycle().clone(),
        node_a.bus().clone(),
        leases.clone(),
        scheduler_config(),
        "scheduler-a",
    );
    let second = ReconnectionScheduler::new(
        node_a.lifecycle().clone(),
        node_a.bus().clone(),
        leases.clone(),
        scheduler_config(),
        "scheduler-b",
    );

    first.start();
    assert!(eventually(Duration::from_secs(1), || async { first.is_leader() }).await);
    second.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_leader());
    assert!(second.is_running());

    first.shutdown().await;
    let lease = leases
        .get_lease(&scheduler_config().lease_key)
        .await
        .unwrap();
    assert!(lease.map_or(true, |l| l.owner != "scheduler-a"));
    assert!(eventually(Duration::from_secs(1), || async { second.is_leader() }).await);

    second.shutdown().await;
    assert!(leases.get_lease(&scheduler_config().lease_key).await.unwrap().is_none());
}

#[tokio::test]
async fn lost_lease_halts_the_loop() {
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let leases: Arc<dyn EventStore> = Arc::new(KvEventStore::new(kv.clone()));
    let (node_a, _) = runtime_with(fast_config("node-a"), kv, ScriptedClient::new()).await;
    let config = ReconnectionConfig {
        lease_ttl: Duration::from_millis(40),
        ..scheduler_config()
    };
    let scheduler = ReconnectionScheduler::new(
        node_a.lifecycle().clone(),
        node_a.bus().clone(),
        leases.clone(),
        config.clone(),
        "scheduler-a",
    );

    scheduler.start();
    assert!(eventually(Duration::from_secs(1), || async { scheduler.is_leader() }).await);

    // Another owner steals the key; the next renewal fails.
    leases.release_lease("scheduler-a", &config.lease_key).await.unwrap();
    leases
        .acquire_lease("intruder", Duration::from_secs(30), &config.lease_key)
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(1), || async { !scheduler.is_running() }).await);
    assert!(!scheduler.is_leader());
    assert_eq!(
        leases.get_lease(&config.lease_key).await.unwrap().unwrap().owner,
        "intruder"
    );
}
