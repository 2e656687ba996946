//! Verification of anchored query results.
//!
//! Recomputes the content hash for the current result set and compares it
//! with the hash recorded at anchoring time. For records still awaiting
//! confirmation the ledger is asked whether the anchoring transactions are
//! final.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::error::{AnchorError, AnchorErrorKind, Step};
use super::hasher;
use super::index_store::HashIndexStore;
use super::retry::RetryPolicy;
use crate::adapters::{DocumentStore, DocumentStream, LedgerClient, LedgerError, TransactionStatus};
use crate::domain::{AnchorStatus, ContentHash, HashRecord, QueryIdentity};

/// Outcome of a verification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    /// Recomputed hash equals the stored hash
    pub matches: bool,

    /// Status of the stored record
    pub status: AnchorStatus,

    /// Whether the ledger considers the anchor final.
    ///
    /// `None` when the record never reached the ledger.
    pub ledger_confirmed: Option<bool>,

    /// Aggregate ledger status of the anchoring transactions, when queried
    pub ledger_status: Option<TransactionStatus>,

    pub stored_hash: ContentHash,
    pub computed_hash: ContentHash,

    /// Lineage the stored record belongs to
    pub attempt: u32,

    /// Documents hashed for the comparison
    pub document_count: u64,
}

/// Combined status of a set of transactions: rejected if any is, confirmed
/// only if all are
pub async fn ledger_status(
    ledger: &dyn LedgerClient,
    transaction_ids: &[String],
) -> Result<TransactionStatus, LedgerError> {
    if transaction_ids.is_empty() {
        return Err(LedgerError::Protocol("record carries no transaction ids".to_string()));
    }

    let mut combined = TransactionStatus::Confirmed;
    for id in transaction_ids {
        match ledger.get_status(id).await? {
            TransactionStatus::Rejected => return Ok(TransactionStatus::Rejected),
            TransactionStatus::Pending => combined = TransactionStatus::Pending,
            TransactionStatus::Confirmed => {}
        }
    }
    Ok(combined)
}

/// Checks current query results against their anchored hash
#[derive(Clone)]
pub struct Verifier {
    index: Arc<dyn HashIndexStore>,
    ledger: Arc<dyn LedgerClient>,
    store_retry: RetryPolicy,
}

impl Verifier {
    pub fn new(index: Arc<dyn HashIndexStore>, ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            index,
            ledger,
            store_retry: RetryPolicy::default(),
        }
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    /// Verify `documents` (the current result set) against the stored record
    #[instrument(skip(self, documents), fields(query = %identity.namespace()))]
    pub async fn verify(
        &self,
        identity: &QueryIdentity,
        documents: DocumentStream,
    ) -> Result<VerificationResult, AnchorError> {
        let record = self.stored_record(identity).await?;
        self.verify_record(identity, record, documents).await
    }

    /// Run the query against `documents` and verify the result
    #[instrument(skip(self, documents), fields(query = %identity.namespace()))]
    pub async fn verify_query(
        &self,
        documents: &dyn DocumentStore,
        identity: &QueryIdentity,
    ) -> Result<VerificationResult, AnchorError> {
        let record = self.stored_record(identity).await?;
        let stream = documents
            .find(identity)
            .await
            .map_err(|e| AnchorError::new(Step::Hashing, Some(record.status), e))?;
        self.verify_record(identity, record, stream).await
    }

    async fn verify_record(
        &self,
        identity: &QueryIdentity,
        record: HashRecord,
        documents: DocumentStream,
    ) -> Result<VerificationResult, AnchorError> {
        let (computed_hash, document_count) = hasher::compute_stream(identity, documents)
            .await
            .map_err(|e| AnchorError::new(Step::Hashing, Some(record.status), e))?;

        let ledger_status = if record.status == AnchorStatus::SignedAwaitingConfirmation {
            let ids = record.transaction_ids();
            let status = ledger_status(self.ledger.as_ref(), &ids)
                .await
                .map_err(|e| AnchorError::new(Step::Confirming, Some(record.status), e))?;
            Some(status)
        } else {
            None
        };

        let ledger_confirmed = match record.status {
            AnchorStatus::Confirmed => Some(true),
            AnchorStatus::SignedAwaitingConfirmation => ledger_status.map(|s| s.is_confirmed()),
            AnchorStatus::PendingCreation | AnchorStatus::Failed => None,
        };

        let result = VerificationResult {
            matches: computed_hash == record.hash,
            status: record.status,
            ledger_confirmed,
            ledger_status,
            stored_hash: record.hash,
            computed_hash,
            attempt: record.attempt,
            document_count,
        };

        if result.matches {
            info!(status = %result.status, ?ledger_confirmed, "Query results match anchored hash");
        } else {
            warn!(
                stored = %result.stored_hash,
                computed = %result.computed_hash,
                "Query results differ from anchored hash"
            );
        }
        Ok(result)
    }

    async fn stored_record(&self, identity: &QueryIdentity) -> Result<HashRecord, AnchorError> {
        self.store_retry
            .run("get", || self.index.get(identity))
            .await
            .map_err(|e| AnchorError::new(Step::Persisting, None, e))?
            .ok_or_else(|| {
                AnchorError::new(
                    Step::Persisting,
                    None,
                    AnchorErrorKind::UnknownQuery(identity.to_string()),
                )
            })
    }
}
