//! Anchoring core.
//!
//! This module contains:
//! - Hasher: canonical content hash of a query result set
//! - IndexStore: persistent hash records and their status history
//! - Deriver: deterministic ledger identity per query
//! - Orchestrator: the anchoring workflow
//! - Verifier: recompute-and-compare against anchored hashes

pub mod deriver;
pub mod error;
pub mod hasher;
pub mod index_store;
pub mod orchestrator;
pub mod retry;
pub mod verifier;

// Re-export commonly used types
pub use deriver::{DeriveError, DerivedIdentity, IdentityDeriver, DEFAULT_DERIVATION_KEY};
pub use error::{AnchorError, AnchorErrorKind, Step};
pub use hasher::{CanonicalHasher, SerializationError};
pub use index_store::{HashIndexStore, SqliteIndexStore, StoreError, DEFAULT_BUSY_TIMEOUT};
pub use orchestrator::{AnchorOrchestrator, AnchorSettings};
pub use retry::RetryPolicy;
pub use verifier::{VerificationResult, Verifier};
