//! Anchoring orchestrator.
//!
//! Drives one query through the anchoring workflow:
//! 1. hash the result set
//! 2. persist the hash as `PendingCreation`
//! 3. derive the query's ledger identity
//! 4. submit a memo transaction carrying the hash
//! 5. persist `SignedAwaitingConfirmation` with the ledger reference
//!
//! An explicit ledger rejection marks the record `Failed`. A timeout or
//! transport error leaves it `PendingCreation`: the outcome is unknown and
//! must be reconciled before anchoring again.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use super::deriver::IdentityDeriver;
use super::error::{AnchorError, AnchorErrorKind, Step};
use super::hasher;
use super::index_store::HashIndexStore;
use super::retry::RetryPolicy;
use super::verifier::{ledger_status, Verifier};
use crate::adapters::{DocumentStore, DocumentStream, LedgerClient, LedgerError, SubmitRequest, TransactionStatus};
use crate::domain::{join_reference, AnchorStatus, HashPatch, HashRecord, QueryIdentity};

/// Knobs for the anchoring workflow
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSettings {
    /// Amount carried by each anchoring transaction
    pub amount: u64,

    /// Deadline for a ledger submission; `None` waits indefinitely
    pub submit_timeout: Option<Duration>,

    /// Retry policy for retryable index-store errors
    pub store_retry: RetryPolicy,
}

impl Default for AnchorSettings {
    fn default() -> Self {
        Self {
            amount: 1,
            submit_timeout: Some(Duration::from_secs(30)),
            store_retry: RetryPolicy::default(),
        }
    }
}

/// Coordinates hasher, index store, deriver and ledger
#[derive(Clone)]
pub struct AnchorOrchestrator {
    index: Arc<dyn HashIndexStore>,
    ledger: Arc<dyn LedgerClient>,
    deriver: IdentityDeriver,
    settings: AnchorSettings,
}

impl AnchorOrchestrator {
    pub fn new(
        index: Arc<dyn HashIndexStore>,
        ledger: Arc<dyn LedgerClient>,
        deriver: IdentityDeriver,
    ) -> Self {
        Self {
            index,
            ledger,
            deriver,
            settings: AnchorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: AnchorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &AnchorSettings {
        &self.settings
    }

    pub fn index(&self) -> &Arc<dyn HashIndexStore> {
        &self.index
    }

    pub fn deriver(&self) -> &IdentityDeriver {
        &self.deriver
    }

    /// Verifier sharing this orchestrator's index and ledger
    pub fn verifier(&self) -> Verifier {
        Verifier::new(Arc::clone(&self.index), Arc::clone(&self.ledger))
            .with_store_retry(self.settings.store_retry.clone())
    }

    /// Anchor a result set with the configured submission deadline
    pub async fn anchor(
        &self,
        identity: &QueryIdentity,
        documents: DocumentStream,
    ) -> Result<HashRecord, AnchorError> {
        self.anchor_with_deadline(identity, documents, self.settings.submit_timeout)
            .await
    }

    /// Run the query against `documents` and anchor its result set
    pub async fn anchor_query(
        &self,
        documents: &dyn DocumentStore,
        identity: &QueryIdentity,
    ) -> Result<HashRecord, AnchorError> {
        self.anchor_query_with_deadline(documents, identity, self.settings.submit_timeout)
            .await
    }

    /// Run the query against `documents` and anchor its result set, giving
    /// the ledger at most `deadline` to answer
    pub async fn anchor_query_with_deadline(
        &self,
        documents: &dyn DocumentStore,
        identity: &QueryIdentity,
        deadline: Option<Duration>,
    ) -> Result<HashRecord, AnchorError> {
        let stream = match documents.find(identity).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(identity, Step::Hashing, e).await),
        };
        self.anchor_with_deadline(identity, stream, deadline).await
    }

    /// Anchor a result set, giving the ledger at most `deadline` to answer
    #[instrument(skip(self, documents), fields(query = %identity.namespace()))]
    pub async fn anchor_with_deadline(
        &self,
        identity: &QueryIdentity,
        documents: DocumentStream,
        deadline: Option<Duration>,
    ) -> Result<HashRecord, AnchorError> {
        info!("Anchoring query results");

        // 1. Hash
        let (hash, count) = match hasher::compute_stream(identity, documents).await {
            Ok(computed) => computed,
            Err(e) => return Err(self.fail(identity, Step::Hashing, e).await),
        };
        debug!(%hash, documents = count, "Computed content hash");

        // 2. Persist before touching the ledger
        let pending = self.persist(identity, HashPatch::pending(hash.clone())).await?;
        debug!(attempt = pending.attempt, "Hash recorded as pending");

        // 3. Derive
        let derived = match self.deriver.derive(identity, self.ledger.as_ref()) {
            Ok(derived) => derived,
            Err(e) => return Err(self.fail(identity, Step::Deriving, e).await),
        };

        // 4. Submit
        let keypair = derived.keypair();
        let request = SubmitRequest {
            from_address: &derived.address,
            amount: self.settings.amount,
            memo: hash.as_str(),
            keypair: &keypair,
        };
        info!(address = %derived.address, ledger = self.ledger.name(), "Submitting anchor transaction");

        let submission = self.ledger.submit(request);
        let outcome = match deadline {
            Some(limit) => match tokio::time::timeout(limit, submission).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        timeout_ms = limit.as_millis() as u64,
                        "Ledger submission timed out, outcome unknown"
                    );
                    return Err(AnchorError::new(
                        Step::Submitting,
                        Some(pending.status),
                        AnchorErrorKind::LedgerTimeout(limit),
                    ));
                }
            },
            None => submission.await,
        };

        let receipt = match outcome {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(error = %e, "Ledger submission failed, outcome unknown");
                return Err(AnchorError::new(Step::Submitting, Some(pending.status), e));
            }
        };

        if !receipt.accepted {
            let reason = receipt
                .message
                .unwrap_or_else(|| "no reason given".to_string());
            warn!(%reason, "Ledger rejected anchor transaction");

            let failed = self
                .persist(
                    identity,
                    HashPatch::status(AnchorStatus::Failed)
                        .with_hash(hash)
                        .expecting(AnchorStatus::PendingCreation),
                )
                .await?;
            return Err(AnchorError::new(
                Step::Submitting,
                Some(failed.status),
                AnchorErrorKind::LedgerRejected(reason),
            ));
        }

        if receipt.transaction_ids.is_empty() {
            return Err(AnchorError::new(
                Step::Submitting,
                Some(pending.status),
                LedgerError::Protocol("accepted submission carried no transaction ids".to_string()),
            ));
        }

        // 5. Record the signed transaction
        let reference = join_reference(&receipt.transaction_ids);
        let patch = HashPatch::status(AnchorStatus::SignedAwaitingConfirmation)
            .with_hash(hash)
            .with_ledger(derived.address.clone(), derived.fingerprint.clone(), reference.clone());
        let signed = self.persist(identity, patch).await?;

        info!(
            %reference,
            attempt = signed.attempt,
            "Anchor transaction signed, awaiting confirmation"
        );
        Ok(signed)
    }

    /// Reconcile a signed record with the ledger.
    ///
    /// Moves to `Confirmed` once every transaction is final, to `Failed` if
    /// any was rejected. Records in any other status are returned unchanged.
    #[instrument(skip(self), fields(query = %identity.namespace()))]
    pub async fn confirm(&self, identity: &QueryIdentity) -> Result<HashRecord, AnchorError> {
        let record = match self.settings.store_retry.run("get", || self.index.get(identity)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(AnchorError::new(
                    Step::Persisting,
                    None,
                    AnchorErrorKind::UnknownQuery(identity.to_string()),
                ))
            }
            Err(e) => return Err(AnchorError::new(Step::Persisting, None, e)),
        };

        if record.status != AnchorStatus::SignedAwaitingConfirmation {
            debug!(status = %record.status, "Nothing to confirm");
            return Ok(record);
        }

        let status = ledger_status(self.ledger.as_ref(), &record.transaction_ids())
            .await
            .map_err(|e| AnchorError::new(Step::Confirming, Some(record.status), e))?;

        let next = match status {
            TransactionStatus::Confirmed => AnchorStatus::Confirmed,
            TransactionStatus::Rejected => AnchorStatus::Failed,
            TransactionStatus::Pending => {
                debug!("Anchor transaction not yet final");
                return Ok(record);
            }
        };

        let updated = self
            .persist(
                identity,
                HashPatch::status(next)
                    .with_hash(record.hash.clone())
                    .expecting(AnchorStatus::SignedAwaitingConfirmation),
            )
            .await?;
        info!(status = %updated.status, "Reconciled anchor with ledger");
        Ok(updated)
    }

    /// Upsert with retries, reporting failures under `persisting`
    async fn persist(&self, identity: &QueryIdentity, patch: HashPatch) -> Result<HashRecord, AnchorError> {
        match self
            .settings
            .store_retry
            .run("upsert", || self.index.upsert(identity, patch.clone()))
            .await
        {
            Ok(record) => Ok(record),
            Err(e) => Err(self.fail(identity, Step::Persisting, e).await),
        }
    }

    /// Build an error carrying the status persisted right now
    async fn fail(
        &self,
        identity: &QueryIdentity,
        step: Step,
        kind: impl Into<AnchorErrorKind>,
    ) -> AnchorError {
        let kind = kind.into();
        let status = match self.index.get(identity).await {
            Ok(record) => record.map(|r| r.status),
            Err(e) => {
                warn!(error = %e, "Could not read persisted status");
                None
            }
        };
        error!(%step, error = %kind, "Anchoring failed");
        AnchorError::new(step, status, kind)
    }
}
