//! Deterministic ledger identity per query.
//!
//! The signing secret is `HMAC-SHA256(derivation_key, identity string)`, so
//! the ledger account for a query can always be re-derived from the query
//! itself and no key material is ever stored. Only a fingerprint of the
//! secret is persisted for audit.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::hasher::canonical_json;
use crate::adapters::{LedgerClient, LedgerError, LedgerKeypair, LedgerSecret};
use crate::domain::QueryIdentity;

type HmacSha256 = Hmac<Sha256>;

/// Key used when no derivation key is configured
pub const DEFAULT_DERIVATION_KEY: &str = "arkmongo.ledger-identity.v1";

const IDENTITY_FORMAT_VERSION: &str = "arkmongo:v2";
const FINGERPRINT_PREFIX: &[u8] = b"arkmongo:fingerprint|";

#[derive(Debug, Error)]
pub enum DeriveError {
    #[error("Derivation key is empty")]
    EmptyKey,

    #[error("Invalid derivation key: {0}")]
    InvalidKey(String),

    #[error("Ledger key derivation failed: {0}")]
    Ledger(#[from] LedgerError),
}

/// Ledger identity derived for one query
#[derive(Debug, Clone)]
pub struct DerivedIdentity {
    /// Ledger address the anchor is sent from
    pub address: String,

    /// Encoded public key
    pub public_key: Vec<u8>,

    /// Signing secret; never persist or log
    pub secret: LedgerSecret,

    /// Audit fingerprint of the secret
    pub fingerprint: String,
}

impl DerivedIdentity {
    /// Keypair handed to the ledger client for signing
    pub fn keypair(&self) -> LedgerKeypair {
        LedgerKeypair {
            public_key: self.public_key.clone(),
            secret: self.secret.clone(),
        }
    }
}

/// Fixed-format string the secret is derived from.
///
/// Every field is a canonical JSON value, so `|` inside a name stays quoted
/// and cannot shift a field boundary.
pub fn identity_string(identity: &QueryIdentity) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        IDENTITY_FORMAT_VERSION,
        canonical_json(&Value::String(identity.store_name.clone())),
        canonical_json(&Value::String(identity.collection_name.clone())),
        identity.canonical_filter(),
        identity.canonical_projection()
    )
}

/// Fingerprint of a secret, safe to persist
pub fn fingerprint(secret: &LedgerSecret) -> String {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_PREFIX);
    hasher.update(secret.expose());
    hex::encode(&hasher.finalize()[..16])
}

/// Derives per-query ledger identities
#[derive(Clone)]
pub struct IdentityDeriver {
    key: Vec<u8>,
    network_prefix: u8,
}

impl std::fmt::Debug for IdentityDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityDeriver")
            .field("network_prefix", &self.network_prefix)
            .finish_non_exhaustive()
    }
}

impl IdentityDeriver {
    pub fn new(key: impl AsRef<[u8]>, network_prefix: u8) -> Result<Self, DeriveError> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(DeriveError::EmptyKey);
        }
        Ok(Self {
            key: key.to_vec(),
            network_prefix,
        })
    }

    pub fn network_prefix(&self) -> u8 {
        self.network_prefix
    }

    /// Secret for a query identity
    pub fn secret(&self, identity: &QueryIdentity) -> Result<LedgerSecret, DeriveError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|e| DeriveError::InvalidKey(e.to_string()))?;
        mac.update(identity_string(identity).as_bytes());

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&mac.finalize().into_bytes());
        Ok(LedgerSecret::from_bytes(bytes))
    }

    /// Full ledger identity, using the ledger's key and address scheme
    pub fn derive(
        &self,
        identity: &QueryIdentity,
        ledger: &dyn LedgerClient,
    ) -> Result<DerivedIdentity, DeriveError> {
        let secret = self.secret(identity)?;
        let keypair = ledger.derive_key(&secret)?;
        let address = ledger.derive_address(&keypair.public_key, self.network_prefix)?;

        Ok(DerivedIdentity {
            address,
            public_key: keypair.public_key,
            fingerprint: fingerprint(&secret),
            secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryLedger;
    use serde_json::json;

    fn orders() -> QueryIdentity {
        QueryIdentity::new("shop", "orders", json!({"status": "paid"}), json!({}))
    }

    #[test]
    fn test_identity_string_format() {
        assert_eq!(
            identity_string(&orders()),
            r#"arkmongo:v2|"shop"|"orders"|{"status":"paid"}|{}"#
        );
    }

    #[test]
    fn test_derive_is_pure() {
        let deriver = IdentityDeriver::new(DEFAULT_DERIVATION_KEY, 0x17).unwrap();
        let ledger = MemoryLedger::new();

        let first = deriver.derive(&orders(), &ledger).unwrap();
        let second = deriver.derive(&orders(), &ledger).unwrap();

        assert_eq!(first.address, second.address);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.secret, second.secret);
    }

    #[test]
    fn test_key_order_does_not_change_identity() {
        let deriver = IdentityDeriver::new(DEFAULT_DERIVATION_KEY, 0x17).unwrap();
        let a = QueryIdentity::new("shop", "orders", json!({"a": 1, "b": 2}), json!({}));
        let b = QueryIdentity::new("shop", "orders", json!({"b": 2, "a": 1}), json!({}));
        assert_eq!(deriver.secret(&a).unwrap(), deriver.secret(&b).unwrap());
    }

    #[test]
    fn test_distinct_queries_get_distinct_accounts() {
        let deriver = IdentityDeriver::new(DEFAULT_DERIVATION_KEY, 0x17).unwrap();
        let ledger = MemoryLedger::new();
        let other = QueryIdentity::new("shop", "orders", json!({"status": "open"}), json!({}));

        let a = deriver.derive(&orders(), &ledger).unwrap();
        let b = deriver.derive(&other, &ledger).unwrap();
        assert_ne!(a.address, b.address);
    }

    #[test]
    fn test_separator_in_names_does_not_alias() {
        let deriver = IdentityDeriver::new(DEFAULT_DERIVATION_KEY, 0x17).unwrap();
        let ledger = MemoryLedger::new();
        let left = QueryIdentity::new("a|b", "c", json!({}), json!({}));
        let right = QueryIdentity::new("a", "b|c", json!({}), json!({}));

        assert_ne!(identity_string(&left), identity_string(&right));
        let a = deriver.derive(&left, &ledger).unwrap();
        let b = deriver.derive(&right, &ledger).unwrap();
        assert_ne!(a.address, b.address);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_derivation_key_changes_account() {
        let ledger = MemoryLedger::new();
        let a = IdentityDeriver::new("key-a", 0x17).unwrap().derive(&orders(), &ledger).unwrap();
        let b = IdentityDeriver::new("key-b", 0x17).unwrap().derive(&orders(), &ledger).unwrap();
        assert_ne!(a.address, b.address);
    }

    #[test]
    fn test_fingerprint_does_not_reveal_secret() {
        let deriver = IdentityDeriver::new(DEFAULT_DERIVATION_KEY, 0x17).unwrap();
        let secret = deriver.secret(&orders()).unwrap();
        let print = fingerprint(&secret);

        assert_eq!(print.len(), 32);
        assert!(!hex::encode(secret.expose()).contains(&print));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(IdentityDeriver::new("", 0x17), Err(DeriveError::EmptyKey)));
    }
}
