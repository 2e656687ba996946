//! Anchoring Integration Tests
//!
//! End-to-end runs of the anchoring workflow against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use arkmongo::adapters::{document_stream, MemoryDocumentStore, MemoryLedger};
use arkmongo::core::{
    AnchorErrorKind, AnchorOrchestrator, AnchorSettings, HashIndexStore, IdentityDeriver,
    SqliteIndexStore, Step, StoreError, DEFAULT_DERIVATION_KEY,
};
use arkmongo::domain::{AnchorStatus, QueryIdentity};
use serde_json::json;

const PAID_ORDERS_HASH: &str = "8f3ceea3f9f3e3fd144b23013801527d5f1802e2239667aaeece6213fe436c2a";

struct Harness {
    index: Arc<SqliteIndexStore>,
    ledger: Arc<MemoryLedger>,
    documents: MemoryDocumentStore,
    orchestrator: AnchorOrchestrator,
}

fn harness() -> Harness {
    let index = Arc::new(SqliteIndexStore::open_in_memory().unwrap());
    let ledger = Arc::new(MemoryLedger::new());
    let deriver = IdentityDeriver::new(DEFAULT_DERIVATION_KEY, 0x17).unwrap();
    let orchestrator = AnchorOrchestrator::new(index.clone(), ledger.clone(), deriver);

    let documents = MemoryDocumentStore::new();
    documents.set_collection(
        "shop",
        "orders",
        vec![
            json!({"id": 1, "status": "paid", "total": 10}),
            json!({"id": 2, "status": "paid", "total": 20}),
            json!({"id": 3, "status": "open", "total": 5}),
        ],
    );

    Harness {
        index,
        ledger,
        documents,
        orchestrator,
    }
}

fn paid_orders() -> QueryIdentity {
    QueryIdentity::new(
        "shop",
        "orders",
        json!({"status": "paid"}),
        json!({"id": 1, "total": 1}),
    )
}

#[tokio::test]
async fn test_anchor_paid_orders() {
    let h = harness();
    let identity = paid_orders();

    let record = h.orchestrator.anchor_query(&h.documents, &identity).await.unwrap();

    assert_eq!(record.hash.as_str(), PAID_ORDERS_HASH);
    assert_eq!(record.status, AnchorStatus::SignedAwaitingConfirmation);
    assert_eq!(record.attempt, 1);
    assert_eq!(record.ledger_address.as_ref().map(String::len), Some(42));
    assert_eq!(record.ledger_secret_fingerprint.as_ref().map(String::len), Some(32));

    let transactions = h.ledger.transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(record.transaction_ids(), vec![transactions[0].id.clone()]);
    assert_eq!(transactions[0].memo, PAID_ORDERS_HASH);

    // Persisted record equals the returned one
    assert_eq!(h.index.get(&identity).await.unwrap(), Some(record));
}

#[tokio::test]
async fn test_pending_is_persisted_before_signing() {
    let h = harness();
    let identity = paid_orders();

    h.orchestrator.anchor_query(&h.documents, &identity).await.unwrap();

    let history = h.index.history(&identity).await.unwrap();
    let transitions: Vec<_> = history.iter().map(|e| (e.from_status, e.to_status)).collect();
    assert_eq!(
        transitions,
        vec![
            (None, AnchorStatus::PendingCreation),
            (
                Some(AnchorStatus::PendingCreation),
                AnchorStatus::SignedAwaitingConfirmation
            ),
        ]
    );
    assert!(history[0].timestamp <= history[1].timestamp);
    assert!(history[0].ledger_reference.is_none());
    assert!(history[1].ledger_reference.is_some());
}

#[tokio::test]
async fn test_ledger_rejection_marks_failed() {
    let h = harness();
    let identity = paid_orders();
    h.ledger.reject_submissions("insufficient funds");

    let err = h
        .orchestrator
        .anchor_query(&h.documents, &identity)
        .await
        .unwrap_err();

    assert_eq!(err.step, Step::Submitting);
    assert_eq!(err.status, Some(AnchorStatus::Failed));
    assert!(matches!(err.kind, AnchorErrorKind::LedgerRejected(ref reason) if reason == "insufficient funds"));
    assert!(!err.outcome_unknown());

    let record = h.index.get(&identity).await.unwrap().unwrap();
    assert_eq!(record.status, AnchorStatus::Failed);
    assert!(record.ledger_reference.is_none());
}

#[tokio::test]
async fn test_submission_timeout_leaves_pending() {
    let h = harness();
    let identity = paid_orders();
    h.ledger.delay_submissions(Duration::from_millis(500));

    let stream = document_stream(vec![json!({"id": 1, "total": 10})]);
    let err = h
        .orchestrator
        .anchor_with_deadline(&identity, stream, Some(Duration::from_millis(20)))
        .await
        .unwrap_err();

    assert_eq!(err.step, Step::Submitting);
    assert_eq!(err.status, Some(AnchorStatus::PendingCreation));
    assert!(matches!(err.kind, AnchorErrorKind::LedgerTimeout(_)));
    assert!(err.outcome_unknown());

    // The ledger may still have accepted it; the index only knows it is pending
    assert_eq!(h.ledger.transactions().len(), 1);
    let record = h.index.get(&identity).await.unwrap().unwrap();
    assert_eq!(record.status, AnchorStatus::PendingCreation);
    assert!(record.ledger_reference.is_none());
}

#[tokio::test]
async fn test_transport_failure_leaves_pending() {
    let h = harness();
    let identity = paid_orders();
    h.ledger.fail_submissions("connection reset");

    let err = h
        .orchestrator
        .anchor_query(&h.documents, &identity)
        .await
        .unwrap_err();

    assert!(err.outcome_unknown());
    assert_eq!(err.status, Some(AnchorStatus::PendingCreation));
}

#[tokio::test]
async fn test_pending_record_can_be_resumed() {
    let h = harness();
    let identity = paid_orders();
    h.ledger.fail_submissions("connection reset");
    h.orchestrator
        .anchor_query(&h.documents, &identity)
        .await
        .unwrap_err();

    h.ledger.accept_submissions();
    let record = h.orchestrator.anchor_query(&h.documents, &identity).await.unwrap();

    assert_eq!(record.status, AnchorStatus::SignedAwaitingConfirmation);
    assert_eq!(record.attempt, 1);
}

#[tokio::test]
async fn test_reanchor_after_failure_starts_new_lineage() {
    let h = harness();
    let identity = paid_orders();
    h.ledger.reject_submissions("insufficient funds");
    h.orchestrator
        .anchor_query(&h.documents, &identity)
        .await
        .unwrap_err();

    h.ledger.accept_submissions();
    let record = h.orchestrator.anchor_query(&h.documents, &identity).await.unwrap();

    assert_eq!(record.attempt, 2);
    assert_eq!(record.status, AnchorStatus::SignedAwaitingConfirmation);

    let lineage = h.index.lineage(&identity).await.unwrap();
    assert_eq!(lineage.len(), 1);
    assert_eq!(lineage[0].attempt, 1);
    assert_eq!(lineage[0].status, AnchorStatus::Failed);
}

#[tokio::test]
async fn test_reanchor_while_signed_is_refused() {
    let h = harness();
    let identity = paid_orders();
    h.orchestrator.anchor_query(&h.documents, &identity).await.unwrap();

    let err = h
        .orchestrator
        .anchor_query(&h.documents, &identity)
        .await
        .unwrap_err();

    assert_eq!(err.step, Step::Persisting);
    assert_eq!(err.status, Some(AnchorStatus::SignedAwaitingConfirmation));
    assert!(matches!(
        err.kind,
        AnchorErrorKind::Store(StoreError::InvalidTransition { .. })
    ));
    assert_eq!(h.ledger.submission_count(), 1);
}

#[tokio::test]
async fn test_concurrent_anchors_leave_one_consistent_record() {
    let h = harness();
    let identity = paid_orders();

    let (first, second) = tokio::join!(
        h.orchestrator.anchor_query(&h.documents, &identity),
        h.orchestrator.anchor_query(&h.documents, &identity),
    );

    let winners: Vec<_> = [first, second].into_iter().filter_map(Result::ok).collect();
    assert_eq!(winners.len(), 1);

    let records = h.index.list().await.unwrap();
    assert_eq!(records.len(), 1);

    let (_, stored) = &records[0];
    assert_eq!(stored, &winners[0]);
    let ledger_ids: Vec<String> = h.ledger.transactions().into_iter().map(|tx| tx.id).collect();
    for id in stored.transaction_ids() {
        assert!(ledger_ids.contains(&id));
    }
}

#[tokio::test]
async fn test_confirm_moves_to_confirmed() {
    let h = harness();
    let identity = paid_orders();
    h.orchestrator.anchor_query(&h.documents, &identity).await.unwrap();

    h.ledger.confirm_all();
    let record = h.orchestrator.confirm(&identity).await.unwrap();
    assert_eq!(record.status, AnchorStatus::Confirmed);

    // Terminal: confirming again is a no-op
    let again = h.orchestrator.confirm(&identity).await.unwrap();
    assert_eq!(again, record);

    let history = h.index.history(&identity).await.unwrap();
    assert_eq!(history.last().map(|e| e.to_status), Some(AnchorStatus::Confirmed));
}

#[tokio::test]
async fn test_confirm_rejected_transaction_fails() {
    let h = harness();
    let identity = paid_orders();
    let record = h.orchestrator.anchor_query(&h.documents, &identity).await.unwrap();

    for id in record.transaction_ids() {
        h.ledger.reject(&id);
    }
    let record = h.orchestrator.confirm(&identity).await.unwrap();
    assert_eq!(record.status, AnchorStatus::Failed);
    // The ledger fields of the failed lineage stay for audit
    assert!(record.ledger_reference.is_some());
}

#[tokio::test]
async fn test_same_query_reuses_ledger_address() {
    let h = harness();
    let identity = paid_orders();
    let first = h.orchestrator.anchor_query(&h.documents, &identity).await.unwrap();

    h.ledger.confirm_all();
    h.orchestrator.confirm(&identity).await.unwrap();
    h.documents.insert("shop", "orders", json!({"id": 4, "status": "paid", "total": 40}));

    let second = h.orchestrator.anchor_query(&h.documents, &identity).await.unwrap();

    assert_eq!(second.attempt, 2);
    assert_ne!(second.hash, first.hash);
    assert_eq!(second.ledger_address, first.ledger_address);
    assert_eq!(second.ledger_secret_fingerprint, first.ledger_secret_fingerprint);
}

#[tokio::test]
async fn test_missing_collection_fails_before_persisting() {
    let h = harness();
    let identity = QueryIdentity::new("shop", "refunds", json!({}), json!({}));

    let err = h
        .orchestrator
        .anchor_query(&h.documents, &identity)
        .await
        .unwrap_err();

    assert_eq!(err.step, Step::Hashing);
    assert_eq!(err.status, None);
    assert!(matches!(err.kind, AnchorErrorKind::Documents(_)));
    assert!(h.index.get(&identity).await.unwrap().is_none());
    assert_eq!(h.ledger.submission_count(), 0);
}

#[tokio::test]
async fn test_configured_amount_is_sent() {
    let h = harness();
    let orchestrator = h.orchestrator.clone().with_settings(AnchorSettings {
        amount: 7,
        ..AnchorSettings::default()
    });

    orchestrator
        .anchor_query(&h.documents, &paid_orders())
        .await
        .unwrap();

    assert_eq!(h.ledger.transactions()[0].amount, 7);
}

#[tokio::test]
async fn test_concurrent_snapshots_keep_winner_hash() {
    let h = harness();
    let identity = QueryIdentity::new("shop", "orders", json!({"status": "paid"}), json!({}));

    let (first, second) = tokio::join!(
        h.orchestrator
            .anchor(&identity, document_stream(vec![json!({"id": 1, "total": 10})])),
        h.orchestrator
            .anchor(&identity, document_stream(vec![json!({"id": 1, "total": 11})])),
    );

    let winners: Vec<_> = [first, second].into_iter().filter_map(Result::ok).collect();
    assert_eq!(winners.len(), 1);

    let stored = h.index.get(&identity).await.unwrap().unwrap();
    assert_eq!(stored.hash, winners[0].hash);

    // The referenced transaction carries exactly the stored hash
    let reference = stored.transaction_ids();
    let anchored: Vec<_> = h
        .ledger
        .transactions()
        .into_iter()
        .filter(|tx| reference.contains(&tx.id))
        .collect();
    assert_eq!(anchored.len(), 1);
    assert_eq!(anchored[0].memo, stored.hash.as_str());
}
