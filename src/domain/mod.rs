//! Domain types for arkmongo.
//!
//! This module contains the core data structures:
//! - QueryIdentity: The natural key of every proof
//! - HashRecord: Persisted hash and anchoring lifecycle
//! - AnchorEvent: Immutable audit entries for status changes

pub mod events;
pub mod query;
pub mod record;

// Re-export commonly used types
pub use events::AnchorEvent;
pub use query::QueryIdentity;
pub use record::{
    join_reference, split_reference, AnchorStatus, ContentHash, HashPatch, HashRecord, Transition,
};
