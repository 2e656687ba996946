//! Errors surfaced by the anchoring orchestrator and verifier.
//!
//! Every error names the pipeline step that failed and the status persisted
//! for the query at that moment, so an operator can resume with `verify`
//! instead of blindly re-anchoring.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::deriver::DeriveError;
use super::hasher::SerializationError;
use super::index_store::StoreError;
use crate::adapters::{DocumentStoreError, LedgerError};
use crate::domain::AnchorStatus;

/// Pipeline step an error occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Hashing,
    Persisting,
    Deriving,
    Submitting,
    Confirming,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hashing => "hashing",
            Self::Persisting => "persisting",
            Self::Deriving => "deriving",
            Self::Submitting => "submitting",
            Self::Confirming => "confirming",
        })
    }
}

/// What went wrong
#[derive(Debug, Error)]
pub enum AnchorErrorKind {
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Documents(#[from] DocumentStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Derive(#[from] DeriveError),

    #[error("ledger rejected the transaction: {0}")]
    LedgerRejected(String),

    #[error("ledger submission timed out after {0:?}; outcome unknown")]
    LedgerTimeout(Duration),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("no hash record for {0}")]
    UnknownQuery(String),
}

/// Failure of an anchoring or verification workflow
#[derive(Debug, Error)]
#[error(
    "{step} failed (persisted status: {}): {kind}",
    .status.map(|s| s.as_str()).unwrap_or("none")
)]
pub struct AnchorError {
    /// Step that failed
    pub step: Step,

    /// Status persisted for the query when the error was raised
    pub status: Option<AnchorStatus>,

    #[source]
    pub kind: AnchorErrorKind,
}

impl AnchorError {
    pub fn new(step: Step, status: Option<AnchorStatus>, kind: impl Into<AnchorErrorKind>) -> Self {
        Self {
            step,
            status,
            kind: kind.into(),
        }
    }

    /// No record exists for the query
    pub fn is_unknown_query(&self) -> bool {
        matches!(self.kind, AnchorErrorKind::UnknownQuery(_))
    }

    /// The ledger may or may not have accepted the submission; reconcile
    /// with `verify` before anchoring again
    pub fn outcome_unknown(&self) -> bool {
        self.step == Step::Submitting
            && matches!(
                self.kind,
                AnchorErrorKind::LedgerTimeout(_) | AnchorErrorKind::Ledger(_)
            )
    }
}
