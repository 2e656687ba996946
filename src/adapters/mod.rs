//! Adapter interfaces for external systems.
//!
//! Two collaborators sit outside the anchoring pipeline:
//! - a document store that answers `find` for a query identity
//! - a ledger that derives keys, accepts memo transactions and reports status

pub mod documents;
pub mod ledger;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use zeroize::Zeroize;

use crate::domain::QueryIdentity;

pub use documents::{jsonl_stream, JsonlDocumentStore};
pub use ledger::HttpLedgerClient;
pub use memory::{MemoryDocumentStore, MemoryLedger};

// ============================================================================
// Document store
// ============================================================================

/// Errors raised while producing documents
#[derive(Debug, Error)]
pub enum DocumentStoreError {
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Malformed document at {location}: {message}")]
    Malformed { location: String, message: String },

    #[error("Document store IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lazy, ordered sequence of matched documents
pub type DocumentStream = BoxStream<'static, Result<Value, DocumentStoreError>>;

/// Wrap an in-memory result set as a document stream
pub fn document_stream(documents: Vec<Value>) -> DocumentStream {
    Box::pin(futures::stream::iter(documents.into_iter().map(Ok)))
}

/// Read side of a document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable store name
    fn name(&self) -> &str;

    /// Run the identity's query; every call starts a fresh sequence
    async fn find(&self, identity: &QueryIdentity) -> Result<DocumentStream, DocumentStoreError>;
}

// ============================================================================
// Ledger
// ============================================================================

/// Errors reported by a ledger client
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Ledger transport error: {0}")]
    Transport(String),

    #[error("Unexpected ledger response: {0}")]
    Protocol(String),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),
}

/// 32-byte signing secret. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct LedgerSecret([u8; 32]);

impl LedgerSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for LedgerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LedgerSecret(<redacted>)")
    }
}

impl Drop for LedgerSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Keypair produced by [`LedgerClient::derive_key`]
#[derive(Debug, Clone)]
pub struct LedgerKeypair {
    /// Encoded public key
    pub public_key: Vec<u8>,

    /// Secret the client signs with
    pub secret: LedgerSecret,
}

/// An anchoring transaction
#[derive(Debug)]
pub struct SubmitRequest<'a> {
    /// Sender address (derived from the query identity)
    pub from_address: &'a str,

    /// Amount transferred; anchoring only needs the memo
    pub amount: u64,

    /// Memo payload: the content hash
    pub memo: &'a str,

    /// Keypair that signs the transaction
    pub keypair: &'a LedgerKeypair,
}

/// Ledger answer to a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub accepted: bool,

    #[serde(default)]
    pub transaction_ids: Vec<String>,

    /// Rejection reason, if the ledger gave one
    #[serde(default)]
    pub message: Option<String>,
}

/// Inclusion status of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl TransactionStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed)
    }
}

/// Narrow client capability over an append-only ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Human-readable ledger name
    fn name(&self) -> &str;

    /// Derive the keypair for a secret
    fn derive_key(&self, secret: &LedgerSecret) -> Result<LedgerKeypair, LedgerError>;

    /// Derive an address from a public key and network prefix
    fn derive_address(&self, public_key: &[u8], network_prefix: u8) -> Result<String, LedgerError>;

    /// Submit a memo transaction
    async fn submit(&self, request: SubmitRequest<'_>) -> Result<SubmitReceipt, LedgerError>;

    /// Look up inclusion status of a transaction
    async fn get_status(&self, transaction_id: &str) -> Result<TransactionStatus, LedgerError>;
}

/// Ed25519 key derivation shared by the bundled ledger clients
pub(crate) fn ed25519_keypair(secret: &LedgerSecret) -> LedgerKeypair {
    let signing_key = ed25519_dalek::SigningKey::from_bytes(secret.expose());
    LedgerKeypair {
        public_key: signing_key.verifying_key().to_bytes().to_vec(),
        secret: secret.clone(),
    }
}

/// Address = hex(prefix byte || first 20 bytes of SHA-256(public key))
pub(crate) fn hashed_address(public_key: &[u8], network_prefix: u8) -> Result<String, LedgerError> {
    use sha2::{Digest, Sha256};

    if public_key.len() != 32 {
        return Err(LedgerError::InvalidKey(format!(
            "expected 32-byte public key, got {}",
            public_key.len()
        )));
    }
    let digest = Sha256::digest(public_key);
    let mut bytes = Vec::with_capacity(21);
    bytes.push(network_prefix);
    bytes.extend_from_slice(&digest[..20]);
    Ok(hex::encode(bytes))
}
