// Copyright 2025 Cowboy AI, LLC.

//! Advisory leases over the shared store
//!
//! A lease names one owner for a role (reconnection scheduler, event syncer)
//! until it expires. Acquisition is read, check, write with no compare and
//! swap, so two owners can both believe they hold a lease for a short window.
//! Everything guarded by a lease is also idempotent.

use super::event_store::{EventStore, EventStoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Persisted lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Role the lease guards
    pub lease_key: String,
    /// Current holder
    pub owner: String,
    /// When the current holder first acquired it
    pub acquired_at: DateTime<Utc>,
    /// When it lapses unless renewed
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// Fresh lease for `owner`
    pub fn new(lease_key: impl Into<String>, owner: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            lease_key: lease_key.into(),
            owner: owner.into(),
            acquired_at: now,
            expires_at: now + chrono_ttl(ttl),
        }
    }

    /// Whether the lease has lapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether `owner` holds the lease at `now`
    pub fn is_held_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner == owner && !self.is_expired(now)
    }

    /// Push expiry to `now + ttl`
    pub fn extend(&mut self, ttl: Duration) {
        self.expires_at = Utc::now() + chrono_ttl(ttl);
    }
}

pub(crate) fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// One owner's handle on one lease key
#[derive(Debug, Clone)]
pub struct LeaseKeeper {
    store: Arc<dyn EventStore>,
    lease_key: String,
    owner: String,
    ttl: Duration,
}

impl LeaseKeeper {
    /// Create a keeper; nothing is written until [`LeaseKeeper::acquire`]
    pub fn new(
        store: Arc<dyn EventStore>,
        lease_key: impl Into<String>,
        owner: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            lease_key: lease_key.into(),
            owner: owner.into(),
            ttl,
        }
    }

    /// Lease key
    pub fn lease_key(&self) -> &str {
        &self.lease_key
    }

    /// Owner name
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// How often a holder should renew
    pub fn renew_interval(&self) -> Duration {
        (self.ttl / 2).max(Duration::from_millis(1))
    }

    /// Try to take the lease; `Ok(false)` when someone else holds it
    pub async fn acquire(&self) -> Result<bool, EventStoreError> {
        match self
            .store
            .acquire_lease(&self.owner, self.ttl, &self.lease_key)
            .await
        {
            Ok(_) => {
                info!(lease_key = %self.lease_key, owner = %self.owner, "Lease acquired");
                Ok(true)
            }
            Err(EventStoreError::LeaseHeld { owner, .. }) => {
                debug!(lease_key = %self.lease_key, holder = %owner, "Lease held elsewhere");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Renew a held lease; `false` means it was lost
    pub async fn renew(&self) -> bool {
        match self
            .store
            .renew_lease(&self.owner, self.ttl, &self.lease_key)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(lease_key = %self.lease_key, owner = %self.owner, error = %e, "Lease lost");
                false
            }
        }
    }

    /// Release the lease if still held
    pub async fn release(&self) {
        match self.store.release_lease(&self.owner, &self.lease_key).await {
            Ok(true) => info!(lease_key = %self.lease_key, owner = %self.owner, "Lease released"),
            Ok(false) => {}
            Err(e) => warn!(lease_key = %self.lease_key, error = %e, "Failed to release lease"),
        }
    }
}
