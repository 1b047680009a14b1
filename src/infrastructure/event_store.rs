// Copyright 2025 Cowboy AI, LLC.

//! Durable, ordered, multi-consumer event log
//!
//! Records live in the `event_queue` collection under zero-padded ids, so the
//! lexical key order of every backend is also the id order. Consumer offsets,
//! dedup entries and leases live next to them in their own collections.

use super::kv_store::{collections, KeyValueStore, KeyValueStoreExt, StoreError};
use super::lease::{chrono_ttl, LeaseRecord};
use super::offsets::ConsumerOffset;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur when working with the event store
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// Underlying store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Failed to serialize or deserialize record data
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Another owner holds an unexpired lease
    #[error("Lease {lease_key} is held by {owner}")]
    LeaseHeld {
        /// Lease key
        lease_key: String,
        /// Current holder
        owner: String,
    },

    /// The caller does not hold the lease it tried to renew
    #[error("Lease {lease_key} is not held by {owner}")]
    LeaseNotHeld {
        /// Lease key
        lease_key: String,
        /// Caller
        owner: String,
    },
}

impl From<serde_json::Error> for EventStoreError {
    fn from(err: serde_json::Error) -> Self {
        EventStoreError::Serialization(err.to_string())
    }
}

/// One persisted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Strictly increasing id
    pub id: u64,
    /// Wire tag of the event type
    pub event_type: String,
    /// Event payload without the tag
    pub payload: serde_json::Value,
    /// Process that appended the record
    pub source: String,
    /// When the record was appended
    pub created_at: DateTime<Utc>,
    /// Key identifying the logical event across re-deliveries
    pub dedup_key: Option<String>,
}

/// Last application of a dedup key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    /// The dedup key
    pub dedup_key: String,
    /// Id of the record that applied it
    pub event_id: u64,
    /// When the entry stops being honoured
    pub expires_at: DateTime<Utc>,
}

impl DedupEntry {
    /// Whether the entry has lapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Format a record id as its queue key
pub fn record_key(id: u64) -> String {
    format!("{id:020}")
}

/// Event log over a shared store
#[async_trait]
pub trait EventStore: Send + Sync + fmt::Debug {
    /// Append a record, assigning the next id
    async fn append_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        source: &str,
        dedup_key: Option<String>,
    ) -> Result<EventRecord, EventStoreError>;

    /// Records with id greater than `after_id`, in id order, at most `limit`
    async fn fetch_events(&self, after_id: u64, limit: usize) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Number of records in the queue
    async fn queue_len(&self) -> Result<usize, EventStoreError>;

    /// Move a consumer forward to `id`; never moves backwards
    async fn commit_offset(
        &self,
        consumer_id: &str,
        id: u64,
        processed: u64,
    ) -> Result<ConsumerOffset, EventStoreError>;

    /// Current offset of a consumer
    async fn get_offset(&self, consumer_id: &str) -> Result<Option<ConsumerOffset>, EventStoreError>;

    /// Every known consumer offset
    async fn list_offsets(&self) -> Result<Vec<ConsumerOffset>, EventStoreError>;

    /// Operator reset of a consumer to `id`, backwards moves allowed
    async fn reset_offset(&self, consumer_id: &str, id: u64) -> Result<(), EventStoreError>;

    /// Unexpired dedup entry for `dedup_key`
    async fn get_dedup(&self, dedup_key: &str) -> Result<Option<DedupEntry>, EventStoreError>;

    /// Remember that `dedup_key` was applied by record `event_id`
    async fn record_dedup(&self, dedup_key: &str, event_id: u64, ttl: Duration) -> Result<(), EventStoreError>;

    /// Take `lease_key` for `owner` unless another owner holds it unexpired
    async fn acquire_lease(&self, owner: &str, ttl: Duration, lease_key: &str) -> Result<LeaseRecord, EventStoreError>;

    /// Extend a lease still recorded for `owner`
    async fn renew_lease(&self, owner: &str, ttl: Duration, lease_key: &str) -> Result<LeaseRecord, EventStoreError>;

    /// Delete the lease if recorded for `owner`
    async fn release_lease(&self, owner: &str, lease_key: &str) -> Result<bool, EventStoreError>;

    /// Current lease record, expired or not
    async fn get_lease(&self, lease_key: &str) -> Result<Option<LeaseRecord>, EventStoreError>;

    /// Drop records every known consumer has passed once the queue is longer than `max_len`
    async fn trim(&self, max_len: usize) -> Result<usize, EventStoreError>;
}

/// [`EventStore`] on top of any [`KeyValueStore`]
///
/// Lease operations read, check and write without compare and swap. Two
/// processes racing for an expired lease may both succeed for one renewal
/// period.
///
/// The key/value layer has no range reads, so [`EventStore::fetch_events`]
/// and [`EventStore::trim`] list and sort every queue key on each call. Poll
/// cost grows with the queue length, which `sync.max_queue_len` bounds.
#[derive(Debug, Clone)]
pub struct KvEventStore {
    store: Arc<dyn KeyValueStore>,
    last_id: Arc<AtomicU64>,
}

impl KvEventStore {
    /// Create an event store over `store`
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            last_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Next id: the nanosecond clock, bumped past the last id this process issued
    fn next_id(&self) -> u64 {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .map_or(0, |nanos| nanos.max(0) as u64);
        let mut current = self.last_id.load(Ordering::Acquire);
        loop {
            let candidate = now.max(current + 1);
            match self
                .last_id
                .compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }

    async fn record_ids(&self) -> Result<Vec<u64>, EventStoreError> {
        let mut ids: Vec<u64> = self
            .store
            .keys(collections::EVENT_QUEUE)
            .await?
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[async_trait]
impl EventStore for KvEventStore {
    async fn append_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        source: &str,
        dedup_key: Option<String>,
    ) -> Result<EventRecord, EventStoreError> {
        let record = EventRecord {
            id: self.next_id(),
            event_type: event_type.to_string(),
            payload,
            source: source.to_string(),
            created_at: Utc::now(),
            dedup_key,
        };
        self.store
            .put_json(collections::EVENT_QUEUE, &record_key(record.id), &record)
            .await?;
        debug!(id = record.id, event_type = %record.event_type, "Appended event record");
        Ok(record)
    }

    async fn fetch_events(&self, after_id: u64, limit: usize) -> Result<Vec<EventRecord>, EventStoreError> {
        let keys: Vec<String> = self
            .record_ids()
            .await?
            .into_iter()
            .filter(|id| *id > after_id)
            .take(limit)
            .map(record_key)
            .collect();

        let values = self.store.get_many(collections::EVENT_QUEUE, &keys).await?;
        let mut records = Vec::with_capacity(values.len());
        // A record trimmed between listing and reading is simply skipped.
        for value in values.into_iter().flatten() {
            records.push(serde_json::from_value::<EventRecord>(value)?);
        }
        Ok(records)
    }

    async fn queue_len(&self) -> Result<usize, EventStoreError> {
        Ok(self.store.keys(collections::EVENT_QUEUE).await?.len())
    }

    async fn commit_offset(
        &self,
        consumer_id: &str,
        id: u64,
        processed: u64,
    ) -> Result<ConsumerOffset, EventStoreError> {
        let mut offset = self
            .get_offset(consumer_id)
            .await?
            .unwrap_or_else(|| ConsumerOffset::beginning(consumer_id));
        if offset.advance(id, processed) {
            self.store
                .put_json(collections::EVENT_OFFSETS, consumer_id, &offset)
                .await?;
        }
        Ok(offset)
    }

    async fn get_offset(&self, consumer_id: &str) -> Result<Option<ConsumerOffset>, EventStoreError> {
        Ok(self
            .store
            .get_json(collections::EVENT_OFFSETS, consumer_id)
            .await?)
    }

    async fn list_offsets(&self) -> Result<Vec<ConsumerOffset>, EventStoreError> {
        Ok(self
            .store
            .values_json::<ConsumerOffset>(collections::EVENT_OFFSETS)
            .await?
            .into_iter()
            .map(|(_, offset)| offset)
            .collect())
    }

    async fn reset_offset(&self, consumer_id: &str, id: u64) -> Result<(), EventStoreError> {
        let mut offset = self
            .get_offset(consumer_id)
            .await?
            .unwrap_or_else(|| ConsumerOffset::beginning(consumer_id));
        offset.reset_to(id);
        self.store
            .put_json(collections::EVENT_OFFSETS, consumer_id, &offset)
            .await?;
        info!(consumer_id, id, "Consumer offset reset");
        Ok(())
    }

    async fn get_dedup(&self, dedup_key: &str) -> Result<Option<DedupEntry>, EventStoreError> {
        let entry: Option<DedupEntry> = self.store.get_json(collections::EVENT_DEDUP, dedup_key).await?;
        Ok(entry.filter(|e| !e.is_expired(Utc::now())))
    }

    async fn record_dedup(&self, dedup_key: &str, event_id: u64, ttl: Duration) -> Result<(), EventStoreError> {
        let entry = DedupEntry {
            dedup_key: dedup_key.to_string(),
            event_id,
            expires_at: Utc::now() + chrono_ttl(ttl),
        };
        self.store
            .put_json(collections::EVENT_DEDUP, dedup_key, &entry)
            .await?;
        Ok(())
    }

    async fn acquire_lease(&self, owner: &str, ttl: Duration, lease_key: &str) -> Result<LeaseRecord, EventStoreError> {
        let now = Utc::now();
        let lease = match self.get_lease(lease_key).await? {
            Some(current) if current.owner != owner && !current.is_expired(now) => {
                return Err(EventStoreError::LeaseHeld {
                    lease_key: lease_key.to_string(),
                    owner: current.owner,
                });
            }
            Some(mut current) if current.owner == owner => {
                current.extend(ttl);
                current
            }
            _ => LeaseRecord::new(lease_key, owner, ttl),
        };
        self.store.put_json(collections::LEASES, lease_key, &lease).await?;
        Ok(lease)
    }

    async fn renew_lease(&self, owner: &str, ttl: Duration, lease_key: &str) -> Result<LeaseRecord, EventStoreError> {
        match self.get_lease(lease_key).await? {
            Some(mut current) if current.owner == owner => {
                current.extend(ttl);
                self.store
                    .put_json(collections::LEASES, lease_key, &current)
                    .await?;
                Ok(current)
            }
            _ => Err(EventStoreError::LeaseNotHeld {
                lease_key: lease_key.to_string(),
                owner: owner.to_string(),
            }),
        }
    }

    async fn release_lease(&self, owner: &str, lease_key: &str) -> Result<bool, EventStoreError> {
        match self.get_lease(lease_key).await? {
            Some(current) if current.owner == owner => {
                Ok(self.store.delete(collections::LEASES, lease_key).await?)
            }
            _ => Ok(false),
        }
    }

    async fn get_lease(&self, lease_key: &str) -> Result<Option<LeaseRecord>, EventStoreError> {
        Ok(self.store.get_json(collections::LEASES, lease_key).await?)
    }

    async fn trim(&self, max_len: usize) -> Result<usize, EventStoreError> {
        let ids = self.record_ids().await?;
        if ids.len() <= max_len {
            return Ok(0);
        }

        let Some(low_water) = self.list_offsets().await?.iter().map(|o| o.last_id).min() else {
            return Ok(0);
        };

        let mut removed = 0;
        for id in ids.into_iter().take_while(|id| *id <= low_water) {
            if self.store.delete(collections::EVENT_QUEUE, &record_key(id)).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, low_water, "Trimmed event queue");
        }
        Ok(removed)
    }
}
