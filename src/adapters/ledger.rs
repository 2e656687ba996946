//! HTTP ledger client.
//!
//! Talks to a ledger node exposing a small REST surface:
//! - `POST {endpoint}/transactions` with a signed memo transaction
//! - `GET {endpoint}/transactions/{id}` for inclusion status
//!
//! Keys are Ed25519; the signature covers the domain-prefixed tuple
//! `from|amount|memo`.

use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ed25519_keypair, hashed_address, LedgerClient, LedgerError, LedgerKeypair, LedgerSecret,
    SubmitReceipt, SubmitRequest, TransactionStatus,
};

/// Domain prefix for transaction signatures
const ANCHOR_DOMAIN_PREFIX: &[u8] = b"arkmongo.anchor:";

/// Wire form of a submission
#[derive(Debug, Serialize)]
struct TransactionBody<'a> {
    from: &'a str,
    public_key: String,
    amount: u64,
    memo: &'a str,
    signature: String,
}

/// Wire form of a status lookup
#[derive(Debug, Deserialize)]
struct StatusBody {
    status: TransactionStatus,
}

/// REST ledger client
pub struct HttpLedgerClient {
    /// Base URL of the ledger node
    endpoint: String,
    /// HTTP client
    client: reqwest::Client,
}

impl HttpLedgerClient {
    /// Create a client for a ledger endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Create a client whose HTTP requests time out after `timeout`
    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }
}

/// Bytes covered by a transaction signature
pub(crate) fn signing_payload(from: &str, amount: u64, memo: &str) -> Vec<u8> {
    let body = format!("{}|{}|{}", from, amount, memo);
    let mut bytes = Vec::with_capacity(ANCHOR_DOMAIN_PREFIX.len() + body.len());
    bytes.extend_from_slice(ANCHOR_DOMAIN_PREFIX);
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    fn name(&self) -> &str {
        "http"
    }

    fn derive_key(&self, secret: &LedgerSecret) -> Result<LedgerKeypair, LedgerError> {
        Ok(ed25519_keypair(secret))
    }

    fn derive_address(&self, public_key: &[u8], network_prefix: u8) -> Result<String, LedgerError> {
        hashed_address(public_key, network_prefix)
    }

    async fn submit(&self, request: SubmitRequest<'_>) -> Result<SubmitReceipt, LedgerError> {
        let signing_key = SigningKey::from_bytes(request.keypair.secret.expose());
        let payload = signing_payload(request.from_address, request.amount, request.memo);
        let signature = signing_key.sign(&payload);

        let body = TransactionBody {
            from: request.from_address,
            public_key: hex::encode(&request.keypair.public_key),
            amount: request.amount,
            memo: request.memo,
            signature: hex::encode(signature.to_bytes()),
        };

        let response = self
            .client
            .post(self.url("transactions"))
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(%status, from = request.from_address, "Ledger submission answered");

        // 4xx answers still carry a receipt describing the rejection
        if status.is_server_error() {
            return Err(LedgerError::Transport(format!("ledger returned {}", status)));
        }

        response
            .json::<SubmitReceipt>()
            .await
            .map_err(|e| LedgerError::Protocol(format!("invalid submit receipt: {}", e)))
    }

    async fn get_status(&self, transaction_id: &str) -> Result<TransactionStatus, LedgerError> {
        let response = self
            .client
            .get(self.url(&format!("transactions/{}", transaction_id)))
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LedgerError::UnknownTransaction(transaction_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(LedgerError::Transport(format!(
                "ledger returned {}",
                response.status()
            )));
        }

        let body: StatusBody = response
            .json()
            .await
            .map_err(|e| LedgerError::Protocol(format!("invalid status body: {}", e)))?;
        Ok(body.status)
    }
}
