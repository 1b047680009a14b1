// Copyright 2025 Cowboy AI, LLC.

//! Replays the durable event log onto the local bus
//!
//! While it holds its lease, the syncer polls the log, turns each record back
//! into a typed event, skips records whose dedup key was already applied at
//! an equal or newer id, republishes the rest synchronously and commits its
//! offset. Losing the lease drops it back to standby, where it keeps trying
//! to acquire it.

use super::event_store::{EventRecord, EventStore};
use super::lease::LeaseKeeper;
use crate::config::EventSyncConfig;
use crate::errors::LifecycleResult;
use crate::event_bus::EventBus;
use crate::events::{EventEnvelope, EventType, LifecycleEvent};
use crate::tasks::{TaskRegistry, DEFAULT_GRACE};
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SYNC_TASK: &str = "event-syncer";

/// Outcome of one pass over the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Records read
    pub fetched: usize,
    /// Records republished
    pub applied: usize,
    /// Duplicates skipped
    pub duplicates: usize,
    /// Records with unknown or unreplicated types, or undecodable payloads
    pub rejected: usize,
    /// Offset after the pass
    pub offset: u64,
}

struct SyncCore {
    store: Arc<dyn EventStore>,
    bus: Arc<EventBus>,
    config: EventSyncConfig,
    replicated: HashSet<EventType>,
    applied: Mutex<LruCache<String, u64>>,
    // One pass at a time per process.
    pass: Mutex<()>,
}

enum Disposition {
    Apply(LifecycleEvent),
    Duplicate,
    Reject,
}

impl SyncCore {
    async fn consume_once(&self) -> LifecycleResult<SyncReport> {
        let _pass = self.pass.lock().await;
        let consumer_id = self.config.consumer_id.as_str();

        let start = self
            .store
            .get_offset(consumer_id)
            .await?
            .map_or(0, |offset| offset.last_id);
        let records = self.store.fetch_events(start, self.config.batch_size).await?;

        let mut report = SyncReport {
            fetched: records.len(),
            offset: start,
            ..Default::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        for record in records {
            match self.classify(&record).await? {
                Disposition::Apply(event) => {
                    let envelope = EventEnvelope::new(event, record.source.clone());
                    self.bus.publish(envelope, true).await?;
                    if let Some(key) = &record.dedup_key {
                        self.store
                            .record_dedup(key, record.id, self.config.dedup_ttl)
                            .await?;
                        self.applied.lock().await.put(key.clone(), record.id);
                    }
                    report.applied += 1;
                }
                Disposition::Duplicate => report.duplicates += 1,
                Disposition::Reject => report.rejected += 1,
            }
            report.offset = record.id;
        }

        self.store
            .commit_offset(consumer_id, report.offset, report.fetched as u64)
            .await?;
        debug!(
            consumer_id,
            fetched = report.fetched,
            applied = report.applied,
            duplicates = report.duplicates,
            offset = report.offset,
            "Sync pass complete"
        );
        Ok(report)
    }

    async fn classify(&self, record: &EventRecord) -> LifecycleResult<Disposition> {
        let Some(event_type) = EventType::from_tag(&record.event_type) else {
            warn!(id = record.id, event_type = %record.event_type, "Unknown event type in log");
            return Ok(Disposition::Reject);
        };
        if !self.replicated.contains(&event_type) {
            warn!(id = record.id, %event_type, "Event type is not replicated");
            return Ok(Disposition::Reject);
        }

        if let Some(key) = &record.dedup_key {
            if self.already_applied(key, record.id).await? {
                debug!(id = record.id, dedup_key = %key, "Skipping duplicate record");
                return Ok(Disposition::Duplicate);
            }
        }

        match LifecycleEvent::from_payload(event_type, record.payload.clone()) {
            Ok(event) => Ok(Disposition::Apply(event)),
            Err(e) => {
                warn!(id = record.id, %event_type, error = %e, "Undecodable event payload");
                Ok(Disposition::Reject)
            }
        }
    }

    async fn already_applied(&self, key: &str, id: u64) -> LifecycleResult<bool> {
        if let Some(seen) = self.applied.lock().await.get(key) {
            if *seen >= id {
                return Ok(true);
            }
        }
        match self.store.get_dedup(key).await? {
            Some(entry) if entry.event_id >= id => {
                self.applied.lock().await.put(key.to_string(), entry.event_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn trim(&self) {
        if let Some(max_len) = self.config.max_queue_len {
            if let Err(e) = self.store.trim(max_len).await {
                warn!(error = %e, "Event queue trim failed");
            }
        }
    }
}

/// Lease-guarded replicator from the event log to the local bus
pub struct EventSyncer {
    core: Arc<SyncCore>,
    lease: LeaseKeeper,
    leader: Arc<AtomicBool>,
    tasks: TaskRegistry,
}

impl std::fmt::Debug for EventSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSyncer")
            .field("consumer_id", &self.core.config.consumer_id)
            .field("owner", &self.lease.owner())
            .field("leader", &self.is_leader())
            .finish()
    }
}

impl EventSyncer {
    /// Syncer replicating every intent type
    pub fn new(
        store: Arc<dyn EventStore>,
        bus: Arc<EventBus>,
        config: EventSyncConfig,
        owner: impl Into<String>,
    ) -> Self {
        let replicated = EventType::ALL.iter().copied().filter(EventType::is_intent);
        Self::with_event_types(store, bus, config, owner, replicated)
    }

    /// Syncer replicating exactly `event_types`
    pub fn with_event_types(
        store: Arc<dyn EventStore>,
        bus: Arc<EventBus>,
        config: EventSyncConfig,
        owner: impl Into<String>,
        event_types: impl IntoIterator<Item = EventType>,
    ) -> Self {
        let lease = LeaseKeeper::new(store.clone(), config.lease_key.clone(), owner, config.lease_ttl);
        let capacity = NonZeroUsize::new(config.dedup_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            core: Arc::new(SyncCore {
                store,
                bus,
                config,
                replicated: event_types.into_iter().collect(),
                applied: Mutex::new(LruCache::new(capacity)),
                pass: Mutex::new(()),
            }),
            lease,
            leader: Arc::new(AtomicBool::new(false)),
            tasks: TaskRegistry::new(),
        }
    }

    /// Whether `event_type` is replayed from the log
    pub fn replicates(&self, event_type: EventType) -> bool {
        self.core.replicated.contains(&event_type)
    }

    /// Whether this syncer currently holds its lease
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// One pass over the log now, regardless of the lease
    ///
    /// Safe to run next to the poll loop or another process: duplicates are
    /// filtered by dedup key and offsets never move backwards.
    pub async fn consume_once(&self) -> LifecycleResult<SyncReport> {
        self.core.consume_once().await
    }

    /// Start the lease and poll loop
    pub fn start(&self) {
        if self.tasks.is_running(SYNC_TASK) {
            return;
        }
        let core = self.core.clone();
        let lease = self.lease.clone();
        let leader = self.leader.clone();

        self.tasks.spawn_cancellable(SYNC_TASK, move |mut signal| async move {
            let retry_interval = core.config.lease_retry_interval;
            let poll_interval = core.config.poll_interval;
            let renew_interval = lease.renew_interval();
            let mut last_renewal = Instant::now();

            loop {
                if !leader.load(Ordering::Acquire) {
                    match lease.acquire().await {
                        Ok(true) => {
                            leader.store(true, Ordering::Release);
                            last_renewal = Instant::now();
                        }
                        Ok(false) => {}
                        Err(e) => warn!(lease_key = %lease.lease_key(), error = %e, "Lease acquisition failed"),
                    }
                    if !leader.load(Ordering::Acquire) {
                        if !signal.sleep(retry_interval).await {
                            break;
                        }
                        continue;
                    }
                }

                if last_renewal.elapsed() >= renew_interval {
                    if !lease.renew().await {
                        leader.store(false, Ordering::Release);
                        info!(lease_key = %lease.lease_key(), "Event syncer back in standby");
                        continue;
                    }
                    last_renewal = Instant::now();
                }

                if let Err(e) = core.consume_once().await {
                    warn!(error = %e, "Sync pass failed");
                }
                core.trim().await;

                if !signal.sleep(poll_interval).await {
                    break;
                }
            }

            if leader.swap(false, Ordering::AcqRel) {
                lease.release().await;
            }
        });
    }

    /// Stop the loop and release the lease
    pub async fn shutdown(&self) {
        self.tasks.shutdown(DEFAULT_GRACE).await;
        if self.leader.swap(false, Ordering::AcqRel) {
            self.lease.release().await;
        }
    }
}
