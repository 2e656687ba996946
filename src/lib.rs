//! arkmongo - Anchor document query results on a public ledger
//!
//! Computes a canonical content hash over the result set of a document
//! query, records it in a local index, and anchors it as the memo of a
//! ledger transaction sent from an account derived deterministically from
//! the query itself. Anyone holding the query can later recompute the hash
//! and check it against the index and the ledger.
//!
//! # Architecture
//!
//! Every query identity owns one hash record that moves through
//! `PendingCreation -> SignedAwaitingConfirmation -> Confirmed | Failed`.
//! The record is persisted before the ledger is contacted, so a crash or
//! timeout never leaves an anchor the index does not know about.
//!
//! # Modules
//!
//! - `adapters`: Document store and ledger clients (JSONL, HTTP, in-memory)
//! - `core`: Hasher, index store, deriver, orchestrator, verifier
//! - `domain`: Data structures (QueryIdentity, HashRecord, AnchorEvent)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Anchor the paid orders of the shop store
//! arkmongo anchor shop orders --filter '{"status":"paid"}'
//!
//! # Later: check the results are unchanged
//! arkmongo verify shop orders --filter '{"status":"paid"}'
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{AnchorError, AnchorOrchestrator, VerificationResult, Verifier};
pub use domain::{AnchorStatus, ContentHash, HashRecord, QueryIdentity};
