//! In-process collaborators.
//!
//! `MemoryDocumentStore` and `MemoryLedger` back the test suite and make the
//! pipeline embeddable without a running database or ledger node.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::documents::{apply_projection, matches_filter};
use super::{
    document_stream, ed25519_keypair, hashed_address, DocumentStore, DocumentStoreError,
    DocumentStream, LedgerClient, LedgerError, LedgerKeypair, LedgerSecret, SubmitReceipt,
    SubmitRequest, TransactionStatus,
};
use crate::domain::QueryIdentity;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Documents
// ============================================================================

/// Collections held in memory, keyed by (store, collection)
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<(String, String), Vec<Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a whole collection
    pub fn set_collection(&self, store: &str, collection: &str, documents: Vec<Value>) {
        lock(&self.collections).insert((store.to_string(), collection.to_string()), documents);
    }

    /// Append a document to a collection
    pub fn insert(&self, store: &str, collection: &str, document: Value) {
        lock(&self.collections)
            .entry((store.to_string(), collection.to_string()))
            .or_default()
            .push(document);
    }

    /// Apply `update` to every document in a collection
    pub fn update_all<F>(&self, store: &str, collection: &str, mut update: F)
    where
        F: FnMut(&mut Value),
    {
        if let Some(documents) =
            lock(&self.collections).get_mut(&(store.to_string(), collection.to_string()))
        {
            documents.iter_mut().for_each(|doc| update(doc));
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find(&self, identity: &QueryIdentity) -> Result<DocumentStream, DocumentStoreError> {
        let key = (identity.store_name.clone(), identity.collection_name.clone());
        let collections = lock(&self.collections);
        let documents = collections
            .get(&key)
            .ok_or_else(|| DocumentStoreError::CollectionNotFound(identity.namespace()))?;

        let matched = documents
            .iter()
            .filter(|doc| matches_filter(doc, &identity.filter))
            .map(|doc| apply_projection(doc.clone(), &identity.projection))
            .collect();
        Ok(document_stream(matched))
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// A transaction recorded by the in-memory ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTransaction {
    pub id: String,
    pub from: String,
    pub amount: u64,
    pub memo: String,
    pub status: TransactionStatus,
}

#[derive(Default)]
struct LedgerState {
    transactions: Vec<MemoryTransaction>,
    reject_reason: Option<String>,
    transport_failure: Option<String>,
    submit_delay: Option<Duration>,
    submissions: u64,
}

/// In-memory ledger with programmable behavior
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every following submission with `reason`
    pub fn reject_submissions(&self, reason: impl Into<String>) {
        lock(&self.state).reject_reason = Some(reason.into());
    }

    /// Fail every following submission with a transport error
    pub fn fail_submissions(&self, message: impl Into<String>) {
        lock(&self.state).transport_failure = Some(message.into());
    }

    /// Delay every following submission (after it is recorded)
    pub fn delay_submissions(&self, delay: Duration) {
        lock(&self.state).submit_delay = Some(delay);
    }

    /// Restore default accepting behavior
    pub fn accept_submissions(&self) {
        let mut state = lock(&self.state);
        state.reject_reason = None;
        state.transport_failure = None;
        state.submit_delay = None;
    }

    /// Mark a transaction as final
    pub fn confirm(&self, transaction_id: &str) -> bool {
        self.set_status(transaction_id, TransactionStatus::Confirmed)
    }

    /// Mark a transaction as rejected
    pub fn reject(&self, transaction_id: &str) -> bool {
        self.set_status(transaction_id, TransactionStatus::Rejected)
    }

    /// Mark every pending transaction as final
    pub fn confirm_all(&self) {
        for tx in lock(&self.state).transactions.iter_mut() {
            if tx.status == TransactionStatus::Pending {
                tx.status = TransactionStatus::Confirmed;
            }
        }
    }

    /// Recorded transactions, in submission order
    pub fn transactions(&self) -> Vec<MemoryTransaction> {
        lock(&self.state).transactions.clone()
    }

    /// Number of submit calls received (accepted or not)
    pub fn submission_count(&self) -> u64 {
        lock(&self.state).submissions
    }

    fn set_status(&self, transaction_id: &str, status: TransactionStatus) -> bool {
        let mut state = lock(&self.state);
        match state.transactions.iter_mut().find(|tx| tx.id == transaction_id) {
            Some(tx) => {
                tx.status = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    fn name(&self) -> &str {
        "memory"
    }

    fn derive_key(&self, secret: &LedgerSecret) -> Result<LedgerKeypair, LedgerError> {
        Ok(ed25519_keypair(secret))
    }

    fn derive_address(&self, public_key: &[u8], network_prefix: u8) -> Result<String, LedgerError> {
        hashed_address(public_key, network_prefix)
    }

    async fn submit(&self, request: SubmitRequest<'_>) -> Result<SubmitReceipt, LedgerError> {
        let (receipt, delay) = {
            let mut state = lock(&self.state);
            state.submissions += 1;

            if let Some(message) = &state.transport_failure {
                return Err(LedgerError::Transport(message.clone()));
            }

            let receipt = if let Some(reason) = &state.reject_reason {
                SubmitReceipt {
                    accepted: false,
                    transaction_ids: Vec::new(),
                    message: Some(reason.clone()),
                }
            } else {
                let mut hasher = Sha256::new();
                hasher.update(request.from_address.as_bytes());
                hasher.update(request.memo.as_bytes());
                hasher.update(state.submissions.to_be_bytes());
                let id = hex::encode(hasher.finalize());

                state.transactions.push(MemoryTransaction {
                    id: id.clone(),
                    from: request.from_address.to_string(),
                    amount: request.amount,
                    memo: request.memo.to_string(),
                    status: TransactionStatus::Pending,
                });
                SubmitReceipt {
                    accepted: true,
                    transaction_ids: vec![id],
                    message: None,
                }
            };
            (receipt, state.submit_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(receipt)
    }

    async fn get_status(&self, transaction_id: &str) -> Result<TransactionStatus, LedgerError> {
        lock(&self.state)
            .transactions
            .iter()
            .find(|tx| tx.id == transaction_id)
            .map(|tx| tx.status)
            .ok_or_else(|| LedgerError::UnknownTransaction(transaction_id.to_string()))
    }
}
