//! Persistent index of hash records keyed by query identity.
//!
//! The SQLite implementation keeps three tables:
//! - `hash_records`: one row per query identity (the current lineage)
//! - `hash_record_history`: terminal records archived when a new lineage starts
//! - `anchor_events`: append-only log of status changes
//!
//! Every upsert runs in an `IMMEDIATE` transaction, so concurrent writers for
//! the same identity serialize on the database lock and each one validates
//! its status transition against the row it actually sees.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    AnchorEvent, AnchorStatus, ContentHash, HashPatch, HashRecord, QueryIdentity, Transition,
};

/// Default time SQLite waits on a locked database before giving up
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Errors raised by the hash index
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Index store unavailable: {0}")]
    Unavailable(String),

    #[error("Index store busy: {0}")]
    Busy(String),

    #[error("Conflicting change for {identity}: {message}")]
    Conflict { identity: String, message: String },

    #[error("Duplicate index entry: {0}")]
    Duplicate(String),

    #[error("Invalid status transition for {identity}: {from} -> {to}")]
    InvalidTransition {
        identity: String,
        from: String,
        to: AnchorStatus,
    },

    #[error("Invalid patch for {identity}: {message}")]
    InvalidPatch { identity: String, message: String },

    #[error("Corrupt index row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Self::Busy(err.to_string()),
                ErrorCode::ConstraintViolation => Self::Duplicate(err.to_string()),
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    Self::Corrupt(err.to_string())
                }
                _ => Self::Unavailable(err.to_string()),
            },
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

/// Key/value index over query identities
#[async_trait]
pub trait HashIndexStore: Send + Sync {
    /// Ensure tables and unique indexes exist
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Apply a partial update, creating the record if absent
    async fn upsert(&self, identity: &QueryIdentity, patch: HashPatch) -> Result<HashRecord, StoreError>;

    /// Current record for an identity
    async fn get(&self, identity: &QueryIdentity) -> Result<Option<HashRecord>, StoreError>;

    /// Reverse lookup by content hash
    async fn find_by_hash(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<(QueryIdentity, HashRecord)>, StoreError>;

    /// Lookup by derived ledger address
    async fn find_by_address(
        &self,
        address: &str,
    ) -> Result<Option<(QueryIdentity, HashRecord)>, StoreError>;

    /// All current records
    async fn list(&self) -> Result<Vec<(QueryIdentity, HashRecord)>, StoreError>;

    /// Status-change log for an identity, oldest first
    async fn history(&self, identity: &QueryIdentity) -> Result<Vec<AnchorEvent>, StoreError>;

    /// Archived lineages for an identity, oldest attempt first
    async fn lineage(&self, identity: &QueryIdentity) -> Result<Vec<HashRecord>, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hash_records (
    store_name TEXT NOT NULL,
    collection_name TEXT NOT NULL,
    filter TEXT NOT NULL,
    projection TEXT NOT NULL,
    hash TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    ledger_address TEXT,
    ledger_secret_fingerprint TEXT,
    ledger_reference TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_hash_records_identity
    ON hash_records(store_name, collection_name, filter, projection);
CREATE UNIQUE INDEX IF NOT EXISTS idx_hash_records_hash
    ON hash_records(hash);
CREATE UNIQUE INDEX IF NOT EXISTS idx_hash_records_ledger
    ON hash_records(ledger_address, status, ledger_reference);

CREATE TABLE IF NOT EXISTS hash_record_history (
    store_name TEXT NOT NULL,
    collection_name TEXT NOT NULL,
    filter TEXT NOT NULL,
    projection TEXT NOT NULL,
    hash TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    ledger_address TEXT,
    ledger_secret_fingerprint TEXT,
    ledger_reference TEXT,
    archived_at TEXT NOT NULL,
    PRIMARY KEY (store_name, collection_name, filter, projection, attempt)
);

CREATE TABLE IF NOT EXISTS anchor_events (
    id TEXT PRIMARY KEY,
    store_name TEXT NOT NULL,
    collection_name TEXT NOT NULL,
    filter TEXT NOT NULL,
    projection TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    from_status TEXT,
    to_status TEXT NOT NULL,
    hash TEXT NOT NULL,
    ledger_reference TEXT,
    detail TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_anchor_events_identity
    ON anchor_events(store_name, collection_name, filter, projection);
";

const RECORD_COLUMNS: &str = "store_name, collection_name, filter, projection, hash, status, \
     attempt, created_at, updated_at, ledger_address, ledger_secret_fingerprint, ledger_reference";

/// Identity columns as stored
struct IdentityKey {
    store_name: String,
    collection_name: String,
    filter: String,
    projection: String,
}

impl IdentityKey {
    fn of(identity: &QueryIdentity) -> Self {
        Self {
            store_name: identity.store_name.clone(),
            collection_name: identity.collection_name.clone(),
            filter: identity.canonical_filter(),
            projection: identity.canonical_projection(),
        }
    }
}

/// A `hash_records` row before validation
struct RawRecord {
    store_name: String,
    collection_name: String,
    filter: String,
    projection: String,
    hash: String,
    status: String,
    attempt: i64,
    created_at: String,
    updated_at: String,
    ledger_address: Option<String>,
    ledger_secret_fingerprint: Option<String>,
    ledger_reference: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            store_name: row.get(0)?,
            collection_name: row.get(1)?,
            filter: row.get(2)?,
            projection: row.get(3)?,
            hash: row.get(4)?,
            status: row.get(5)?,
            attempt: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            ledger_address: row.get(9)?,
            ledger_secret_fingerprint: row.get(10)?,
            ledger_reference: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<(QueryIdentity, HashRecord), StoreError> {
        let filter = serde_json::from_str(&self.filter)
            .map_err(|e| StoreError::Corrupt(format!("filter: {}", e)))?;
        let projection = serde_json::from_str(&self.projection)
            .map_err(|e| StoreError::Corrupt(format!("projection: {}", e)))?;
        let identity = QueryIdentity::new(self.store_name, self.collection_name, filter, projection);

        let record = HashRecord {
            hash: ContentHash::from_hex(self.hash).map_err(StoreError::Corrupt)?,
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            attempt: u32::try_from(self.attempt)
                .map_err(|_| StoreError::Corrupt(format!("attempt out of range: {}", self.attempt)))?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            ledger_address: self.ledger_address,
            ledger_secret_fingerprint: self.ledger_secret_fingerprint,
            ledger_reference: self.ledger_reference,
        };
        Ok((identity, record))
    }
}

/// Stored timestamps are microsecond RFC 3339 in UTC, so text order is time order
fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", text, e)))
}

/// Reject a patch field that would change an already-submitted value
fn guard_immutable(
    identity: &QueryIdentity,
    field: &str,
    stored: Option<&str>,
    patched: Option<&str>,
) -> Result<(), StoreError> {
    match (stored, patched) {
        (Some(old), Some(new)) if old != new => Err(StoreError::Conflict {
            identity: identity.to_string(),
            message: format!("{} is immutable once submitted ({} != {})", field, old, new),
        }),
        _ => Ok(()),
    }
}

/// Compute the record an upsert should leave behind.
///
/// Returns the new record, whether the previous one must be archived, and
/// the audit event to append (if the status or hash changed).
fn plan_upsert(
    identity: &QueryIdentity,
    current: Option<HashRecord>,
    patch: HashPatch,
    now: DateTime<Utc>,
) -> Result<(HashRecord, Option<HashRecord>, Option<AnchorEvent>), StoreError> {
    let current_status = current.as_ref().map(|r| r.status);
    if let Some(expected) = patch.expected_status {
        if current_status != Some(expected) {
            return Err(StoreError::Conflict {
                identity: identity.to_string(),
                message: format!(
                    "expected status {}, found {}",
                    expected,
                    current_status.map(|s| s.as_str()).unwrap_or("none")
                ),
            });
        }
    }
    let target = patch
        .status
        .or(current_status)
        .unwrap_or(AnchorStatus::PendingCreation);

    match Transition::classify(current_status, target) {
        Transition::Create | Transition::NewLineage => {
            let hash = match (&patch.hash, &current) {
                (Some(hash), _) => hash.clone(),
                (None, Some(previous)) => previous.hash.clone(),
                (None, None) => {
                    return Err(StoreError::InvalidPatch {
                        identity: identity.to_string(),
                        message: "a hash is required to create a record".to_string(),
                    })
                }
            };
            let attempt = current.as_ref().map(|r| r.attempt + 1).unwrap_or(1);
            let record = HashRecord {
                hash: hash.clone(),
                status: target,
                attempt,
                created_at: now,
                updated_at: now,
                ledger_address: patch.ledger_address,
                ledger_secret_fingerprint: patch.ledger_secret_fingerprint,
                ledger_reference: patch.ledger_reference,
            };
            let detail = if current.is_some() {
                format!("new lineage (attempt {})", attempt)
            } else {
                "record created".to_string()
            };
            let event = AnchorEvent::new(attempt, current_status, target, hash, detail)
                .with_reference(record.ledger_reference.clone());
            Ok((record, current, Some(event)))
        }
        Transition::Advance => {
            // Advance always has a current record
            let Some(mut record) = current else {
                return Err(StoreError::InvalidPatch {
                    identity: identity.to_string(),
                    message: "no record to advance".to_string(),
                });
            };
            let previous_status = record.status;
            let previous_hash = record.hash.clone();

            if record.status.is_submitted() {
                guard_immutable(
                    identity,
                    "hash",
                    Some(record.hash.as_str()),
                    patch.hash.as_ref().map(ContentHash::as_str),
                )?;
                guard_immutable(
                    identity,
                    "ledger_address",
                    record.ledger_address.as_deref(),
                    patch.ledger_address.as_deref(),
                )?;
                guard_immutable(
                    identity,
                    "ledger_secret_fingerprint",
                    record.ledger_secret_fingerprint.as_deref(),
                    patch.ledger_secret_fingerprint.as_deref(),
                )?;
                guard_immutable(
                    identity,
                    "ledger_reference",
                    record.ledger_reference.as_deref(),
                    patch.ledger_reference.as_deref(),
                )?;
            }

            if let Some(hash) = patch.hash {
                record.hash = hash;
            }
            if patch.ledger_address.is_some() {
                record.ledger_address = patch.ledger_address;
            }
            if patch.ledger_secret_fingerprint.is_some() {
                record.ledger_secret_fingerprint = patch.ledger_secret_fingerprint;
            }
            if patch.ledger_reference.is_some() {
                record.ledger_reference = patch.ledger_reference;
            }
            record.status = target;
            record.updated_at = now;

            let event = if previous_status != target || previous_hash != record.hash {
                Some(
                    AnchorEvent::new(
                        record.attempt,
                        Some(previous_status),
                        target,
                        record.hash.clone(),
                        format!("{} -> {}", previous_status, target),
                    )
                    .with_reference(record.ledger_reference.clone()),
                )
            } else {
                None
            };
            Ok((record, None, event))
        }
        Transition::Illegal => Err(StoreError::InvalidTransition {
            identity: identity.to_string(),
            from: current_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string()),
            to: target,
        }),
    }
}

/// SQLite-backed hash index
#[derive(Clone)]
pub struct SqliteIndexStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteIndexStore {
    /// Open (or create) an index database file
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "Opened hash index");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory index (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file, if not in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run blocking database work off the async executor
    async fn with_conn<F, T>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            work(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("index worker failed: {}", e)))?
    }
}

fn load_current(conn: &Connection, key: &IdentityKey) -> Result<Option<HashRecord>, StoreError> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM hash_records
                 WHERE store_name = ?1 AND collection_name = ?2 AND filter = ?3 AND projection = ?4",
                RECORD_COLUMNS
            ),
            params![key.store_name, key.collection_name, key.filter, key.projection],
            RawRecord::from_row,
        )
        .optional()?;
    raw.map(|r| r.into_record().map(|(_, record)| record)).transpose()
}

fn query_records(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<(QueryIdentity, HashRecord)>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, RawRecord::from_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

#[async_trait]
impl HashIndexStore for SqliteIndexStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }

    async fn upsert(&self, identity: &QueryIdentity, patch: HashPatch) -> Result<HashRecord, StoreError> {
        let identity = identity.clone();
        self.with_conn(move |conn| {
            let key = IdentityKey::of(&identity);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = load_current(&tx, &key)?;
            let (record, archived, event) = plan_upsert(&identity, current, patch, Utc::now().trunc_subsecs(6))?;

            if let Some(old) = &archived {
                tx.execute(
                    &format!(
                        "INSERT INTO hash_record_history ({}, archived_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                        RECORD_COLUMNS
                    ),
                    params![
                        key.store_name,
                        key.collection_name,
                        key.filter,
                        key.projection,
                        old.hash.as_str(),
                        old.status.as_str(),
                        old.attempt,
                        format_timestamp(&old.created_at),
                        format_timestamp(&old.updated_at),
                        old.ledger_address,
                        old.ledger_secret_fingerprint,
                        old.ledger_reference,
                        format_timestamp(&record.updated_at),
                    ],
                )?;
            }

            tx.execute(
                &format!(
                    "INSERT INTO hash_records ({})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(store_name, collection_name, filter, projection) DO UPDATE SET
                         hash = excluded.hash,
                         status = excluded.status,
                         attempt = excluded.attempt,
                         created_at = excluded.created_at,
                         updated_at = excluded.updated_at,
                         ledger_address = excluded.ledger_address,
                         ledger_secret_fingerprint = excluded.ledger_secret_fingerprint,
                         ledger_reference = excluded.ledger_reference",
                    RECORD_COLUMNS
                ),
                params![
                    key.store_name,
                    key.collection_name,
                    key.filter,
                    key.projection,
                    record.hash.as_str(),
                    record.status.as_str(),
                    record.attempt,
                    format_timestamp(&record.created_at),
                    format_timestamp(&record.updated_at),
                    record.ledger_address,
                    record.ledger_secret_fingerprint,
                    record.ledger_reference,
                ],
            )?;

            if let Some(event) = &event {
                tx.execute(
                    "INSERT INTO anchor_events (
                        id, store_name, collection_name, filter, projection, attempt,
                        from_status, to_status, hash, ledger_reference, detail, timestamp
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        event.id.to_string(),
                        key.store_name,
                        key.collection_name,
                        key.filter,
                        key.projection,
                        event.attempt,
                        event.from_status.map(|s| s.as_str()),
                        event.to_status.as_str(),
                        event.hash.as_str(),
                        event.ledger_reference,
                        event.detail,
                        format_timestamp(&event.timestamp),
                    ],
                )?;
            }

            tx.commit()?;

            debug!(
                query = %identity.namespace(),
                status = %record.status,
                attempt = record.attempt,
                "Upserted hash record"
            );
            Ok(record)
        })
        .await
    }

    async fn get(&self, identity: &QueryIdentity) -> Result<Option<HashRecord>, StoreError> {
        let key = IdentityKey::of(identity);
        self.with_conn(move |conn| load_current(conn, &key)).await
    }

    async fn find_by_hash(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<(QueryIdentity, HashRecord)>, StoreError> {
        let hash = hash.as_str().to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM hash_records WHERE hash = ?1", RECORD_COLUMNS);
            Ok(query_records(conn, &sql, &[&hash])?.into_iter().next())
        })
        .await
    }

    async fn find_by_address(
        &self,
        address: &str,
    ) -> Result<Option<(QueryIdentity, HashRecord)>, StoreError> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM hash_records WHERE ledger_address = ?1",
                RECORD_COLUMNS
            );
            Ok(query_records(conn, &sql, &[&address])?.into_iter().next())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<(QueryIdentity, HashRecord)>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM hash_records ORDER BY updated_at DESC",
                RECORD_COLUMNS
            );
            query_records(conn, &sql, &[])
        })
        .await
    }

    async fn history(&self, identity: &QueryIdentity) -> Result<Vec<AnchorEvent>, StoreError> {
        let key = IdentityKey::of(identity);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, attempt, from_status, to_status, hash, ledger_reference, detail, timestamp
                 FROM anchor_events
                 WHERE store_name = ?1 AND collection_name = ?2 AND filter = ?3 AND projection = ?4
                 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(
                params![key.store_name, key.collection_name, key.filter, key.projection],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )?;

            let mut events = Vec::new();
            for row in rows {
                let (id, attempt, from, to, hash, reference, detail, timestamp) = row?;
                events.push(AnchorEvent {
                    id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    timestamp: parse_timestamp(&timestamp)?,
                    attempt: u32::try_from(attempt)
                        .map_err(|_| StoreError::Corrupt(format!("attempt {}", attempt)))?,
                    from_status: from
                        .map(|s| s.parse::<AnchorStatus>())
                        .transpose()
                        .map_err(StoreError::Corrupt)?,
                    to_status: to.parse().map_err(StoreError::Corrupt)?,
                    hash: ContentHash::from_hex(hash).map_err(StoreError::Corrupt)?,
                    ledger_reference: reference,
                    detail,
                });
            }
            Ok(events)
        })
        .await
    }

    async fn lineage(&self, identity: &QueryIdentity) -> Result<Vec<HashRecord>, StoreError> {
        let key = IdentityKey::of(identity);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM hash_record_history
                 WHERE store_name = ?1 AND collection_name = ?2 AND filter = ?3 AND projection = ?4
                 ORDER BY attempt",
                RECORD_COLUMNS
            );
            let records = query_records(
                conn,
                &sql,
                &[&key.store_name, &key.collection_name, &key.filter, &key.projection],
            )?;
            Ok(records.into_iter().map(|(_, record)| record).collect())
        })
        .await
    }
}
