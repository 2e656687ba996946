//! Hash Index Integration Tests
//!
//! Status transitions, immutability guards, secondary lookups and the audit
//! log of the SQLite index.

use std::sync::Arc;

use arkmongo::core::hasher::compute;
use arkmongo::core::{HashIndexStore, SqliteIndexStore, StoreError, DEFAULT_BUSY_TIMEOUT};
use arkmongo::domain::{AnchorStatus, ContentHash, HashPatch, QueryIdentity};
use serde_json::json;
use tempfile::TempDir;

fn identity(status: &str) -> QueryIdentity {
    QueryIdentity::new("shop", "orders", json!({"status": status}), json!({}))
}

fn hash_of(identity: &QueryIdentity, total: u64) -> ContentHash {
    compute(identity, [json!({"total": total})]).unwrap()
}

fn signed(hash: ContentHash, address: &str, reference: &str) -> HashPatch {
    HashPatch::status(AnchorStatus::SignedAwaitingConfirmation)
        .with_hash(hash)
        .with_ledger(address, "f".repeat(32), reference)
}

#[tokio::test]
async fn test_create_then_sign() {
    let store = SqliteIndexStore::open_in_memory().unwrap();
    let paid = identity("paid");
    let hash = hash_of(&paid, 10);

    let pending = store.upsert(&paid, HashPatch::pending(hash.clone())).await.unwrap();
    assert_eq!(pending.status, AnchorStatus::PendingCreation);
    assert_eq!(pending.attempt, 1);
    assert_eq!(pending.created_at, pending.updated_at);

    let record = store.upsert(&paid, signed(hash.clone(), "17aa", "tx1")).await.unwrap();
    assert_eq!(record.status, AnchorStatus::SignedAwaitingConfirmation);
    assert_eq!(record.created_at, pending.created_at);
    assert!(record.updated_at >= pending.updated_at);
    assert_eq!(record.ledger_reference.as_deref(), Some("tx1"));
}

#[tokio::test]
async fn test_identical_upsert_is_idempotent() {
    let store = SqliteIndexStore::open_in_memory().unwrap();
    let paid = identity("paid");
    let hash = hash_of(&paid, 10);

    store.upsert(&paid, HashPatch::pending(hash.clone())).await.unwrap();
    let first = store.upsert(&paid, signed(hash.clone(), "17aa", "tx1")).await.unwrap();
    let second = store.upsert(&paid, signed(hash.clone(), "17aa", "tx1")).await.unwrap();

    assert_eq!(first.hash, second.hash);
    assert_eq!(first.status, second.status);
    assert_eq!(first.ledger_reference, second.ledger_reference);
    assert_eq!(store.history(&paid).await.unwrap().len(), 2);
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_filter_key_order_is_irrelevant() {
    let store = SqliteIndexStore::open_in_memory().unwrap();
    let a = QueryIdentity::new("shop", "orders", json!({"status": "paid", "region": "eu"}), json!({}));
    let b = QueryIdentity::new("shop", "orders", json!({"region": "eu", "status": "paid"}), json!({}));

    store.upsert(&a, HashPatch::pending(hash_of(&a, 1))).await.unwrap();
    assert!(store.get(&b).await.unwrap().is_some());
}

#[tokio::test]
async fn test_signed_cannot_return_to_pending() {
    let store = SqliteIndexStore::open_in_memory().unwrap();
    let paid = identity("paid");
    let hash = hash_of(&paid, 10);

    store.upsert(&paid, HashPatch::pending(hash.clone())).await.unwrap();
    store.upsert(&paid, signed(hash.clone(), "17aa", "tx1")).await.unwrap();

    let err = store.upsert(&paid, HashPatch::pending(hash)).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidTransition { to: AnchorStatus::PendingCreation, .. }
    ));
}

#[tokio::test]
async fn test_submitted_fields_are_immutable() {
    let store = SqliteIndexStore::open_in_memory().unwrap();
    let paid = identity("paid");
    let hash = hash_of(&paid, 10);

    store.upsert(&paid, HashPatch::pending(hash.clone())).await.unwrap();
    store.upsert(&paid, signed(hash.clone(), "17aa", "tx1")).await.unwrap();

    let other_reference = store.upsert(&paid, signed(hash.clone(), "17aa", "tx2")).await;
    assert!(matches!(other_reference, Err(StoreError::Conflict { .. })));

    let other_hash = store
        .upsert(
            &paid,
            HashPatch::status(AnchorStatus::Confirmed).with_hash(hash_of(&paid, 11)),
        )
        .await;
    assert!(matches!(other_hash, Err(StoreError::Conflict { .. })));

    // Rejected writes leave the record and its history untouched
    let record = store.get(&paid).await.unwrap().unwrap();
    assert_eq!(record.ledger_reference.as_deref(), Some("tx1"));
    assert_eq!(record.hash, hash);
    assert_eq!(store.history(&paid).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_pending_hash_can_be_replaced() {
    let store = SqliteIndexStore::open_in_memory().unwrap();
    let paid = identity("paid");

    store.upsert(&paid, HashPatch::pending(hash_of(&paid, 10))).await.unwrap();
    let record = store.upsert(&paid, HashPatch::pending(hash_of(&paid, 11))).await.unwrap();

    assert_eq!(record.hash, hash_of(&paid, 11));
    assert_eq!(record.attempt, 1);
}

#[tokio::test]
async fn test_new_lineage_archives_previous() {
    let store = SqliteIndexStore::open_in_memory().unwrap();
    let paid = identity("paid");
    let first_hash = hash_of(&paid, 10);

    store.upsert(&paid, HashPatch::pending(first_hash.clone())).await.unwrap();
    store.upsert(&paid, signed(first_hash.clone(), "17aa", "tx1")).await.unwrap();
    let confirmed = store
        .upsert(&paid, HashPatch::status(AnchorStatus::Confirmed))
        .await
        .unwrap();

    let next = store.upsert(&paid, HashPatch::pending(hash_of(&paid, 11))).await.unwrap();
    assert_eq!(next.attempt, 2);
    assert!(next.ledger_reference.is_none());

    let lineage = store.lineage(&paid).await.unwrap();
    assert_eq!(lineage, vec![confirmed]);

    let history = store.history(&paid).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.attempt, 2);
    assert_eq!(last.from_status, Some(AnchorStatus::Confirmed));
    assert_eq!(last.to_status, AnchorStatus::PendingCreation);
}

#[tokio::test]
async fn test_secondary_lookups() {
    let store = SqliteIndexStore::open_in_memory().unwrap();
    let paid = identity("paid");
    let open = identity("open");
    let paid_hash = hash_of(&paid, 10);
    let open_hash = hash_of(&open, 10);

    store.upsert(&paid, HashPatch::pending(paid_hash.clone())).await.unwrap();
    store.upsert(&paid, signed(paid_hash.clone(), "17aa", "tx1")).await.unwrap();
    store.upsert(&open, HashPatch::pending(open_hash.clone())).await.unwrap();

    let (found, record) = store.find_by_hash(&paid_hash).await.unwrap().unwrap();
    assert_eq!(found, paid);
    assert_eq!(record.hash, paid_hash);

    let (found, _) = store.find_by_address("17aa").await.unwrap().unwrap();
    assert_eq!(found, paid);

    assert!(store.find_by_address("17ff").await.unwrap().is_none());
    assert_eq!(store.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_same_hash_for_two_identities_is_rejected() {
    let store = SqliteIndexStore::open_in_memory().unwrap();
    let plain = QueryIdentity::new("shop", "orders", json!({"status": "paid"}), json!({}));
    let projected = QueryIdentity::new("shop", "orders", json!({"status": "paid"}), json!({"total": 1}));

    // Projection is not part of the digest, so identical results collide
    let hash = hash_of(&plain, 10);
    assert_eq!(hash, hash_of(&projected, 10));

    store.upsert(&plain, HashPatch::pending(hash.clone())).await.unwrap();
    let err = store.upsert(&projected, HashPatch::pending(hash)).await.unwrap_err();
    assert!(matches!(err, StoreError::Duplicate(_)));
    assert!(store.get(&projected).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_writers_serialize() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(SqliteIndexStore::open(&temp.path().join("index.db"), DEFAULT_BUSY_TIMEOUT).unwrap());
    let paid = identity("paid");
    let hash = hash_of(&paid, 10);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let paid = paid.clone();
        let hash = hash.clone();
        handles.push(tokio::spawn(async move {
            store.upsert(&paid, HashPatch::pending(hash)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.list().await.unwrap().len(), 1);
    // Only the creating write changed anything
    assert_eq!(store.history(&paid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_migrate_is_repeatable() {
    let store = SqliteIndexStore::open_in_memory().unwrap();
    store.migrate().await.unwrap();
    store.migrate().await.unwrap();
    assert!(store.list().await.unwrap().is_empty());
}
