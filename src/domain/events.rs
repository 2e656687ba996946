//! Audit events for the anchoring lifecycle.
//!
//! Every status change of a hash record is also appended to an immutable
//! event log, written in the same transaction as the record update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{AnchorStatus, ContentHash};

/// A single entry in the anchor event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred
    pub timestamp: DateTime<Utc>,

    /// Record lineage this event belongs to
    pub attempt: u32,

    /// Status before the change (`None` when the record was created)
    pub from_status: Option<AnchorStatus>,

    /// Status after the change
    pub to_status: AnchorStatus,

    /// Hash stored after the change
    pub hash: ContentHash,

    /// Ledger reference stored after the change
    pub ledger_reference: Option<String>,

    /// Human-readable summary (NO secrets)
    pub detail: String,
}

impl AnchorEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        attempt: u32,
        from_status: Option<AnchorStatus>,
        to_status: AnchorStatus,
        hash: ContentHash,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            attempt,
            from_status,
            to_status,
            hash,
            ledger_reference: None,
            detail: detail.into(),
        }
    }

    /// Attach the ledger reference
    pub fn with_reference(mut self, reference: Option<String>) -> Self {
        self.ledger_reference = reference;
        self
    }
}
