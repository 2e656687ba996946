//! Hash records and the anchor status state machine.
//!
//! A record is created the first time a query identity is hashed and then
//! only moves forward through its lifecycle:
//!
//! ```text
//! PendingCreation -> SignedAwaitingConfirmation -> Confirmed
//!        |                       |
//!        +-------> Failed <------+
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an anchored hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    /// Hash computed and persisted, no ledger interaction yet
    PendingCreation,

    /// Transaction submitted, awaiting ledger confirmation
    SignedAwaitingConfirmation,

    /// Ledger reported the transaction as final
    Confirmed,

    /// Submission rejected, or ledger reported rejection
    Failed,
}

impl AnchorStatus {
    /// Stable persisted name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingCreation => "pending_creation",
            Self::SignedAwaitingConfirmation => "signed_awaiting_confirmation",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses end a record lineage
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    /// Whether the hash has left the local machine
    pub fn is_submitted(&self) -> bool {
        !matches!(self, Self::PendingCreation)
    }

    /// Whether `self -> next` is a legal move within one lineage.
    ///
    /// Self-transitions are allowed so identical patches stay idempotent.
    /// Starting a new lineage after a terminal status is not a transition;
    /// see [`Transition::classify`].
    pub fn can_transition_to(&self, next: AnchorStatus) -> bool {
        use AnchorStatus::*;
        match (*self, next) {
            (a, b) if a == b => true,
            (PendingCreation, SignedAwaitingConfirmation) => true,
            (PendingCreation, Failed) => true,
            (SignedAwaitingConfirmation, Confirmed) => true,
            (SignedAwaitingConfirmation, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnchorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_creation" => Ok(Self::PendingCreation),
            "signed_awaiting_confirmation" => Ok(Self::SignedAwaitingConfirmation),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown anchor status: {}", other)),
        }
    }
}

/// How a requested status relates to the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No record yet; must start at `PendingCreation`
    Create,

    /// Legal move within the current lineage
    Advance,

    /// Terminal record re-enters `PendingCreation` as attempt + 1
    NewLineage,

    /// Anything else
    Illegal,
}

impl Transition {
    /// Classify moving from `current` (if any) to `next`
    pub fn classify(current: Option<AnchorStatus>, next: AnchorStatus) -> Self {
        match current {
            None if next == AnchorStatus::PendingCreation => Self::Create,
            None => Self::Illegal,
            Some(cur) if cur.is_terminal() && next == AnchorStatus::PendingCreation => {
                Self::NewLineage
            }
            Some(cur) if cur.can_transition_to(next) => Self::Advance,
            Some(_) => Self::Illegal,
        }
    }
}

/// 256-bit content digest, lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wrap a hex digest, validating its shape
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, String> {
        let hex = hex.into();
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("not a 256-bit hex digest: {}", hex));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    pub(crate) fn from_digest(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Hex text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted proof record for one query identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashRecord {
    /// Content hash of the query result
    pub hash: ContentHash,

    /// Current lifecycle status
    pub status: AnchorStatus,

    /// Lineage counter (1 for the first anchoring attempt)
    pub attempt: u32,

    /// When the record (this lineage) was created
    pub created_at: DateTime<Utc>,

    /// Last modification
    pub updated_at: DateTime<Utc>,

    /// Derived ledger address used for anchoring
    pub ledger_address: Option<String>,

    /// Fingerprint of the derived secret (never the secret itself)
    pub ledger_secret_fingerprint: Option<String>,

    /// Transaction id(s) returned by the ledger, comma separated
    pub ledger_reference: Option<String>,
}

impl HashRecord {
    /// Transaction ids recorded for this lineage
    pub fn transaction_ids(&self) -> Vec<String> {
        self.ledger_reference
            .as_deref()
            .map(split_reference)
            .unwrap_or_default()
    }
}

/// Join transaction ids into the persisted reference form
pub fn join_reference(ids: &[String]) -> String {
    ids.join(",")
}

/// Split a persisted reference back into transaction ids
pub fn split_reference(reference: &str) -> Vec<String> {
    reference
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Partial update applied by [`HashIndexStore::upsert`](crate::core::HashIndexStore::upsert).
///
/// `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HashPatch {
    pub hash: Option<ContentHash>,
    pub status: Option<AnchorStatus>,
    pub ledger_address: Option<String>,
    pub ledger_secret_fingerprint: Option<String>,
    pub ledger_reference: Option<String>,
    /// Apply only if the stored status is exactly this one
    pub expected_status: Option<AnchorStatus>,
}

impl HashPatch {
    /// Patch that (re)starts a record at `PendingCreation` with `hash`
    pub fn pending(hash: ContentHash) -> Self {
        Self {
            hash: Some(hash),
            status: Some(AnchorStatus::PendingCreation),
            ..Self::default()
        }
    }

    /// Patch moving to `status`
    pub fn status(status: AnchorStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Guard the patch with the hash the caller expects to be stored
    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn with_ledger(
        mut self,
        address: impl Into<String>,
        fingerprint: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        self.ledger_address = Some(address.into());
        self.ledger_secret_fingerprint = Some(fingerprint.into());
        self.ledger_reference = Some(reference.into());
        self
    }

    /// Compare-and-swap on the stored status
    pub fn expecting(mut self, status: AnchorStatus) -> Self {
        self.expected_status = Some(status);
        self
    }
}
