// Copyright 2025 Cowboy AI, LLC.

//! Infrastructure layer for cim-lifecycle
//!
//! This module contains the shared-store concerns:
//! - Key-value store abstraction and its in-memory and NATS backends
//! - Durable event log with offsets, dedup entries and leases
//! - Event syncer replaying the log onto the local bus

pub mod event_store;
/// Replays the durable log onto the local bus
pub mod event_syncer;
pub mod kv_store;
/// Advisory leases over the shared store
pub mod lease;
pub mod nats_kv_store;
pub mod offsets;

pub use event_store::{DedupEntry, EventRecord, EventStore, EventStoreError, KvEventStore};
pub use event_syncer::{EventSyncer, SyncReport};
pub use kv_store::{
    collections, InMemoryKeyValueStore, KeyValueStore, KeyValueStoreExt, StoreError,
};
pub use lease::{LeaseKeeper, LeaseRecord};
pub use nats_kv_store::{NatsKvConfig, NatsKvStore};
pub use offsets::ConsumerOffset;
