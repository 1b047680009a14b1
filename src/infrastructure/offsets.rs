// Copyright 2025 Cowboy AI, LLC.

//! Consumer offsets into the event log
//!
//! An offset is a consumer's bookmark: the id of the last record it has
//! fully applied. Offsets only move forward unless an operator resets them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress of one consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOffset {
    /// Consumer this offset belongs to
    pub consumer_id: String,
    /// Id of the last applied record
    pub last_id: u64,
    /// When the offset last moved
    pub updated_at: DateTime<Utc>,
    /// Total records processed by this consumer
    pub events_processed: u64,
}

impl ConsumerOffset {
    /// Offset positioned before the first record
    pub fn beginning(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            last_id: 0,
            updated_at: Utc::now(),
            events_processed: 0,
        }
    }

    /// Move forward to `id`, counting `processed` records
    ///
    /// Returns `false` and leaves the offset untouched when `id` is not ahead
    /// of the current position.
    pub fn advance(&mut self, id: u64, processed: u64) -> bool {
        if id <= self.last_id {
            return false;
        }
        self.last_id = id;
        self.events_processed = self.events_processed.saturating_add(processed);
        self.updated_at = Utc::now();
        true
    }

    /// Operator reset to an arbitrary position
    pub fn reset_to(&mut self, id: u64) {
        self.last_id = id;
        self.updated_at = Utc::now();
    }
}
