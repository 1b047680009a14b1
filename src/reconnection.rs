// Copyright 2025 Cowboy AI, LLC.

//! Reconnection scheduling
//!
//! A lease-guarded scan over identities in RECONNECTING or CIRCUIT_OPEN. The
//! scheduler owns the retry bookkeeping in metadata (`reconnect_attempts`,
//! `next_retry_time`) and asks for connections by publishing
//! [`ReconnectionRequested`]. It never changes state.

use crate::config::ReconnectionConfig;
use crate::connection::duration_ms;
use crate::errors::LifecycleResult;
use crate::event_bus::{EventBus, EventHandler};
use crate::events::{
    EventEnvelope, EventType, LifecycleEvent, ReconnectionRequested, ReconnectionScheduled,
    ServiceTimeout, TimeoutKind,
};
use crate::identity::ServiceIdentity;
use crate::infrastructure::event_store::EventStore;
use crate::infrastructure::lease::{chrono_ttl, LeaseKeeper};
use crate::lifecycle::LifecycleManager;
use crate::state_machine::ServiceConnectionState;
use crate::tasks::{TaskRegistry, DEFAULT_GRACE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Event source name of the reconnection scheduler
pub const SOURCE: &str = "reconnection_scheduler";

/// Event types the scheduler reacts to
pub const HANDLED_EVENTS: [EventType; 1] = [EventType::StateChanged];

const SCAN_TASK: &str = "reconnection-scan";

/// Exponential backoff clamped to a ceiling
///
/// `delay(n) = min(base * 2^n, max)`. `delay(0)` is `base` (clamped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Delay cap
    pub max: Duration,
}

impl BackoffPolicy {
    /// Create a policy
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `retry_count`
    pub fn delay(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl From<&ReconnectionConfig> for BackoffPolicy {
    fn from(config: &ReconnectionConfig) -> Self {
        Self::new(config.base_delay, config.max_delay)
    }
}

/// What one scan did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Identities that got a first `next_retry_time`
    pub scheduled: usize,
    /// Reconnections requested
    pub requested: usize,
    /// Identities that hit the retry ceiling
    pub exhausted: usize,
}

#[derive(Debug, Clone)]
struct Scanner {
    lifecycle: Arc<LifecycleManager>,
    bus: Arc<EventBus>,
    backoff: BackoffPolicy,
    max_retries: u32,
    attempt_timeout: Duration,
}

impl Scanner {
    async fn scan_once(&self) -> LifecycleResult<ScanReport> {
        let mut report = ScanReport::default();
        let waiting = self
            .lifecycle
            .identities_in(&[
                ServiceConnectionState::Reconnecting,
                ServiceConnectionState::CircuitOpen,
            ])
            .await?;

        for identity in waiting {
            let Some(meta) = self.lifecycle.get_metadata(&identity).await? else {
                continue;
            };
            let now = Utc::now();

            match meta.next_retry_time {
                None => {
                    self.schedule(&identity, meta.reconnect_attempts, now).await?;
                    report.scheduled += 1;
                }
                // The last booked attempt keeps its whole window before giving up.
                Some(due) if now >= due && meta.reconnect_attempts >= self.max_retries => {
                    let elapsed_ms = duration_ms(meta.time_in_state(now));
                    info!(
                        identity = %identity,
                        attempts = meta.reconnect_attempts,
                        "Reconnection retries exhausted"
                    );
                    let event = LifecycleEvent::ServiceTimeout(ServiceTimeout {
                        identity,
                        kind: TimeoutKind::Reconnection,
                        elapsed_ms,
                    });
                    self.bus.emit(event, SOURCE, true).await?;
                    report.exhausted += 1;
                }
                Some(due) if now >= due => {
                    let retry_count = meta.reconnect_attempts;
                    let next = retry_count.saturating_add(1);
                    let mut delay = self.backoff.delay(next);
                    if next >= self.max_retries {
                        // The final attempt outlives its own connect timeout.
                        delay = delay.max(self.attempt_timeout);
                    }
                    let next_retry_time = now + chrono_ttl(delay);
                    // Book the attempt before asking, so a fast reconnect clears it afterwards.
                    let updated = self
                        .lifecycle
                        .update_metadata(&identity, |m| {
                            m.reconnect_attempts = next;
                            m.next_retry_time = Some(next_retry_time);
                        })
                        .await?;
                    if updated.is_none() {
                        continue;
                    }
                    debug!(identity = %identity, retry_count, "Reconnection due");
                    let event = LifecycleEvent::ReconnectionRequested(ReconnectionRequested {
                        identity: identity.clone(),
                        retry_count,
                    });
                    self.bus.emit(event, SOURCE, false).await?;
                    self.announce(&identity, next_retry_time, delay).await?;
                    report.requested += 1;
                }
                Some(_) => {}
            }
        }
        Ok(report)
    }

    async fn schedule(&self, identity: &ServiceIdentity, attempts: u32, now: DateTime<Utc>) -> LifecycleResult<()> {
        let delay = self.backoff.delay(attempts);
        let next_retry_time = now + chrono_ttl(delay);
        let updated = self
            .lifecycle
            .update_metadata(identity, |m| m.next_retry_time = Some(next_retry_time))
            .await?;
        if updated.is_none() {
            return Ok(());
        }
        self.announce(identity, next_retry_time, delay).await
    }

    async fn announce(
        &self,
        identity: &ServiceIdentity,
        next_retry_time: DateTime<Utc>,
        delay: Duration,
    ) -> LifecycleResult<()> {
        debug!(identity = %identity, delay_ms = duration_ms(delay), "Reconnection scheduled");
        let event = LifecycleEvent::ReconnectionScheduled(ReconnectionScheduled {
            identity: identity.clone(),
            next_retry_time,
            delay_ms: duration_ms(delay),
        });
        self.bus.emit(event, SOURCE, false).await
    }
}

/// Lease-guarded retry loop
pub struct ReconnectionScheduler {
    scanner: Scanner,
    lease: LeaseKeeper,
    scan_interval: Duration,
    leader: Arc<AtomicBool>,
    tasks: TaskRegistry,
}

impl std::fmt::Debug for ReconnectionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionScheduler")
            .field("backoff", &self.scanner.backoff)
            .field("max_retries", &self.scanner.max_retries)
            .field("leader", &self.is_leader())
            .finish()
    }
}

impl ReconnectionScheduler {
    /// Create a scheduler whose lease is owned by `owner`
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        bus: Arc<EventBus>,
        leases: Arc<dyn EventStore>,
        config: ReconnectionConfig,
        owner: impl Into<String>,
    ) -> Self {
        let lease = LeaseKeeper::new(leases, config.lease_key.clone(), owner, config.lease_ttl);
        Self {
            scanner: Scanner {
                lifecycle,
                bus,
                backoff: BackoffPolicy::from(&config),
                max_retries: config.max_retries,
                attempt_timeout: Duration::ZERO,
            },
            lease,
            scan_interval: config.scan_interval,
            leader: Arc::new(AtomicBool::new(false)),
            tasks: TaskRegistry::new(),
        }
    }

    /// Keep the final attempt's window open for at least `timeout`
    ///
    /// Set to the connect timeout, so giving up never races a connect that
    /// may still succeed.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.scanner.attempt_timeout = timeout;
        self
    }

    /// Backoff in use
    pub fn backoff(&self) -> BackoffPolicy {
        self.scanner.backoff
    }

    /// Whether this scheduler holds the scan lease
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Whether the scan loop is alive
    pub fn is_running(&self) -> bool {
        self.tasks.is_running(SCAN_TASK)
    }

    /// Run one scan now, ignoring the lease
    pub async fn scan_once(&self) -> LifecycleResult<ScanReport> {
        self.scanner.scan_once().await
    }

    /// Start the scan loop
    ///
    /// The loop waits in standby until it gets the lease. A failed renewal
    /// ends the loop.
    pub fn start(&self) {
        if self.is_running() {
            return;
        }
        let scanner = self.scanner.clone();
        let lease = self.lease.clone();
        let leader = self.leader.clone();
        let scan_interval = self.scan_interval;

        self.tasks.spawn_cancellable(SCAN_TASK, move |mut signal| async move {
            loop {
                match lease.acquire().await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => warn!(lease_key = %lease.lease_key(), error = %e, "Lease acquisition failed"),
                }
                if !signal.sleep(scan_interval).await {
                    return;
                }
            }
            leader.store(true, Ordering::Release);
            info!(owner = %lease.owner(), "Reconnection scheduler active");

            let renew_interval = lease.renew_interval();
            let mut last_renewal = Instant::now();
            while signal.sleep(scan_interval).await {
                if last_renewal.elapsed() >= renew_interval {
                    if !lease.renew().await {
                        warn!(lease_key = %lease.lease_key(), "Reconnection scheduler halted after losing its lease");
                        leader.store(false, Ordering::Release);
                        return;
                    }
                    last_renewal = Instant::now();
                }
                if let Err(e) = scanner.scan_once().await {
                    warn!(error = %e, "Reconnection scan failed");
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

#[async_trait]
impl EventHandler for ReconnectionScheduler {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn handle(&self, envelope: &EventEnvelope) -> LifecycleResult<()> {
        if let LifecycleEvent::StateChanged(e) = &envelope.event {
            if e.new_state == ServiceConnectionState::Healthy {
                self.scanner
                    .lifecycle
                    .update_metadata(&e.identity, |m| m.clear_retry())
                    .await?;
            }
        }
        Ok(())
    }
}
