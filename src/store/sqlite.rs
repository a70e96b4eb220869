//! SQLite implementation of every storage seam.
//!
//! The connection sits behind `Arc<Mutex<Connection>>`; every call runs on
//! the blocking pool and the lock is never held across an await.

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ApplyOutcome, OrderStore, StorageError};
use crate::dead_letter::{
    DeadLetterReason, DeadLetterRecord, DeadLetterStorage, Resolution, ResolutionAction,
};
use crate::ledger::{LedgerStorage, ProcessedMessageRecord};
use crate::model::{
    DeviceId, HighResTimestamp, MessageId, MessageType, OrderId, Priority, UnixTimeMs,
};
use crate::order::{ApplyEffect, Order, OrderMutation};
use crate::outbox::{EntryStatus, OutboxEntry, OutboxStorage};
use crate::resolver::StatusPrecedence;
use crate::retry::FailureKind;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS outbox_entries (
    message_id          TEXT PRIMARY KEY,
    message_type        TEXT NOT NULL,
    payload             TEXT NOT NULL,
    checksum            TEXT NOT NULL,
    entity_version      INTEGER NOT NULL,
    created_at          INTEGER NOT NULL,
    high_res_timestamp  INTEGER NOT NULL,
    priority            INTEGER NOT NULL,
    is_additive         INTEGER NOT NULL,
    retry_count         INTEGER NOT NULL,
    status              TEXT NOT NULL,
    last_attempt_at     INTEGER,
    last_error          TEXT,
    last_failure        TEXT
);
CREATE INDEX IF NOT EXISTS idx_outbox_status_created
    ON outbox_entries (status, created_at, high_res_timestamp);

CREATE TABLE IF NOT EXISTS processed_messages (
    message_id    TEXT PRIMARY KEY,
    message_type  TEXT NOT NULL,
    sender_id     TEXT NOT NULL,
    processed_at  INTEGER NOT NULL,
    checksum      TEXT NOT NULL,
    payload_hash  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_processed_at ON processed_messages (processed_at);

CREATE TABLE IF NOT EXISTS dead_letters (
    id                   TEXT PRIMARY KEY,
    original_message_id  TEXT NOT NULL,
    message_type         TEXT NOT NULL,
    payload              TEXT NOT NULL,
    checksum             TEXT NOT NULL,
    entity_version       INTEGER NOT NULL,
    high_res_timestamp   INTEGER NOT NULL,
    priority             INTEGER NOT NULL,
    failure_reason       TEXT NOT NULL,
    failure_count        INTEGER NOT NULL,
    last_error           TEXT,
    requires_review      INTEGER NOT NULL,
    created_at           INTEGER NOT NULL,
    resolved_at          INTEGER,
    resolved_by          TEXT,
    resolution_action    TEXT,
    resolution_notes     TEXT
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_open ON dead_letters (resolved_at, created_at);

CREATE TABLE IF NOT EXISTS orders (
    order_id    TEXT PRIMARY KEY,
    version     INTEGER NOT NULL,
    status      TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    body        TEXT NOT NULL
);
";

const ENTRY_COLUMNS: &str = "message_id, message_type, payload, checksum, entity_version, \
     created_at, high_res_timestamp, priority, is_additive, retry_count, status, \
     last_attempt_at, last_error, last_failure";

const DEAD_LETTER_COLUMNS: &str = "id, original_message_id, message_type, payload, checksum, \
     entity_version, high_res_timestamp, priority, failure_reason, failure_count, last_error, \
     requires_review, created_at, resolved_at, resolved_by, resolution_action, resolution_notes";

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn to_sql(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn corrupted(table: &'static str, key: &str, reason: impl Into<String>) -> StorageError {
    StorageError::Corrupted {
        table,
        key: key.to_string(),
        reason: reason.into(),
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (creating if needed) a database file and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let shown = path.display().to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StorageError> {
            let conn = Connection::open(&path)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "FULL")?;
            Self::migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))??;

        info!(path = %shown, "Opened sync database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn insert_entry_row(conn: &Connection, entry: &OutboxEntry) -> Result<(), StorageError> {
    let result = conn.execute(
        &format!(
            "INSERT INTO outbox_entries ({ENTRY_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            entry.message_id.to_string(),
            entry.message_type.as_str(),
            entry.payload,
            entry.checksum,
            to_sql(entry.entity_version),
            to_sql(entry.created_at.0),
            to_sql(entry.high_res_timestamp.0),
            entry.priority.value(),
            entry.is_additive,
            entry.retry_count,
            entry.status.as_str(),
            entry.last_attempt_at.map(|t| to_sql(t.0)),
            entry.last_error,
            entry.last_failure.map(FailureKind::as_str),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => {
            Err(StorageError::Duplicate(entry.message_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn count_entry_rows(conn: &Connection) -> Result<usize, StorageError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox_entries", [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// Capacity check plus insert. Callers run it inside a transaction.
fn insert_bounded_entry_row(
    conn: &Connection,
    entry: &OutboxEntry,
    max_entries: usize,
) -> Result<(), StorageError> {
    if count_entry_rows(conn)? >= max_entries {
        return Err(StorageError::Full(max_entries));
    }
    insert_entry_row(conn, entry)
}

fn entry_from_row(row: &Row<'_>) -> Result<OutboxEntry, StorageError> {
    let id: String = row.get(0)?;
    let message_id = MessageId::parse(&id).map_err(|e| corrupted("outbox_entries", &id, e.to_string()))?;
    let message_type: String = row.get(1)?;
    let message_type = MessageType::parse(&message_type)
        .map_err(|e| corrupted("outbox_entries", &id, e.to_string()))?;
    let priority: i64 = row.get(7)?;
    let priority = u8::try_from(priority)
        .ok()
        .and_then(|p| Priority::new(p).ok())
        .ok_or_else(|| corrupted("outbox_entries", &id, format!("priority {priority}")))?;
    let status: String = row.get(10)?;
    let status = EntryStatus::parse(&status)
        .ok_or_else(|| corrupted("outbox_entries", &id, format!("status {status}")))?;
    let last_failure: Option<String> = row.get(13)?;
    let last_failure = match last_failure {
        Some(kind) => Some(
            FailureKind::parse(&kind)
                .ok_or_else(|| corrupted("outbox_entries", &id, format!("failure {kind}")))?,
        ),
        None => None,
    };

    Ok(OutboxEntry {
        message_id,
        message_type,
        payload: row.get(2)?,
        checksum: row.get(3)?,
        entity_version: from_sql(row.get(4)?),
        created_at: UnixTimeMs(from_sql(row.get(5)?)),
        high_res_timestamp: HighResTimestamp(from_sql(row.get(6)?)),
        priority,
        is_additive: row.get(8)?,
        retry_count: row.get(9)?,
        status,
        last_attempt_at: row.get::<_, Option<i64>>(11)?.map(|t| UnixTimeMs(from_sql(t))),
        last_error: row.get(12)?,
        last_failure,
    })
}

fn insert_dead_letter_row(conn: &Connection, record: &DeadLetterRecord) -> Result<(), StorageError> {
    let resolution = record.resolution.as_ref();
    conn.execute(
        &format!(
            "INSERT INTO dead_letters ({DEAD_LETTER_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ),
        params![
            record.id.to_string(),
            record.original_message_id.to_string(),
            record.message_type.as_str(),
            record.payload,
            record.checksum,
            to_sql(record.entity_version),
            to_sql(record.high_res_timestamp.0),
            record.priority.value(),
            record.failure_reason.as_str(),
            record.failure_count,
            record.last_error,
            record.requires_review,
            to_sql(record.created_at.0),
            resolution.map(|r| to_sql(r.resolved_at.0)),
            resolution.map(|r| r.resolved_by.clone()),
            resolution.map(|r| r.action.as_str()),
            resolution.and_then(|r| r.notes.clone()),
        ],
    )?;
    Ok(())
}

fn dead_letter_from_row(row: &Row<'_>) -> Result<DeadLetterRecord, StorageError> {
    let id: String = row.get(0)?;
    let parsed_id = Uuid::parse_str(&id).map_err(|e| corrupted("dead_letters", &id, e.to_string()))?;
    let original: String = row.get(1)?;
    let original_message_id =
        MessageId::parse(&original).map_err(|e| corrupted("dead_letters", &id, e.to_string()))?;
    let message_type: String = row.get(2)?;
    let message_type = MessageType::parse(&message_type)
        .map_err(|e| corrupted("dead_letters", &id, e.to_string()))?;
    let priority: i64 = row.get(7)?;
    let priority = u8::try_from(priority)
        .ok()
        .and_then(|p| Priority::new(p).ok())
        .ok_or_else(|| corrupted("dead_letters", &id, format!("priority {priority}")))?;
    let reason: String = row.get(8)?;
    let failure_reason = DeadLetterReason::parse(&reason)
        .ok_or_else(|| corrupted("dead_letters", &id, format!("reason {reason}")))?;

    let resolved_at: Option<i64> = row.get(13)?;
    let resolution = match resolved_at {
        Some(at) => {
            let action: Option<String> = row.get(15)?;
            let action = action
                .as_deref()
                .and_then(ResolutionAction::parse)
                .ok_or_else(|| corrupted("dead_letters", &id, "resolution without action"))?;
            Some(Resolution {
                resolved_at: UnixTimeMs(from_sql(at)),
                resolved_by: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
                action,
                notes: row.get(16)?,
            })
        }
        None => None,
    };

    Ok(DeadLetterRecord {
        id: parsed_id,
        original_message_id,
        message_type,
        payload: row.get(3)?,
        checksum: row.get(4)?,
        entity_version: from_sql(row.get(5)?),
        high_res_timestamp: HighResTimestamp(from_sql(row.get(6)?)),
        priority,
        failure_reason,
        failure_count: row.get(9)?,
        last_error: row.get(10)?,
        requires_review: row.get(11)?,
        created_at: UnixTimeMs(from_sql(row.get(12)?)),
        resolution,
    })
}

fn insert_processed_row(conn: &Connection, record: &ProcessedMessageRecord) -> Result<bool, StorageError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO processed_messages \
         (message_id, message_type, sender_id, processed_at, checksum, payload_hash) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.message_id.to_string(),
            record.message_type.as_str(),
            record.sender_id.as_str(),
            to_sql(record.processed_at.0),
            record.checksum,
            record.payload_hash,
        ],
    )?;
    Ok(inserted == 1)
}

fn processed_exists(conn: &Connection, message_id: &MessageId) -> Result<bool, StorageError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM processed_messages WHERE message_id = ?1",
            params![message_id.to_string()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn load_order_row(conn: &Connection, order_id: &OrderId) -> Result<Option<Order>, StorageError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM orders WHERE order_id = ?1",
            params![order_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match body {
        Some(body) => serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| corrupted("orders", order_id.as_str(), e.to_string())),
        None => Ok(None),
    }
}

fn upsert_order_row(conn: &Connection, order: &Order) -> Result<(), StorageError> {
    let body = serde_json::to_string(order)?;
    conn.execute(
        "INSERT INTO orders (order_id, version, status, updated_at, body) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(order_id) DO UPDATE SET \
             version = excluded.version, status = excluded.status, \
             updated_at = excluded.updated_at, body = excluded.body",
        params![
            order.order_id.as_str(),
            to_sql(order.version),
            order.status.as_str(),
            to_sql(order.updated_at.0),
            body,
        ],
    )?;
    Ok(())
}

// ============================================================================
// OutboxStorage
// ============================================================================

#[async_trait]
impl OutboxStorage for SqliteStore {
    async fn insert_entry(&self, entry: &OutboxEntry, max_entries: usize) -> Result<(), StorageError> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            insert_bounded_entry_row(&tx, &entry, max_entries)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_entry(&self, message_id: &MessageId) -> Result<Option<OutboxEntry>, StorageError> {
        let id = message_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM outbox_entries WHERE message_id = ?1"
            ))?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => entry_from_row(row).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn load_by_status(
        &self,
        status: EntryStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM outbox_entries WHERE status = ?1 \
                 ORDER BY created_at ASC, high_res_timestamp ASC LIMIT ?2"
            ))?;
            let mut rows = stmt.query(params![status.as_str(), limit])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(entry_from_row(row)?);
            }
            Ok(entries)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        message_id: &MessageId,
        expected: EntryStatus,
        updated: &OutboxEntry,
    ) -> Result<bool, StorageError> {
        let id = message_id.to_string();
        let updated = updated.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE outbox_entries SET \
                     retry_count = ?1, status = ?2, last_attempt_at = ?3, \
                     last_error = ?4, last_failure = ?5 \
                 WHERE message_id = ?6 AND status = ?7",
                params![
                    updated.retry_count,
                    updated.status.as_str(),
                    updated.last_attempt_at.map(|t| to_sql(t.0)),
                    updated.last_error,
                    updated.last_failure.map(FailureKind::as_str),
                    id,
                    expected.as_str(),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn remove_entry(&self, message_id: &MessageId) -> Result<bool, StorageError> {
        let id = message_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM outbox_entries WHERE message_id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn escalate_entry(
        &self,
        message_id: &MessageId,
        expected: EntryStatus,
        record: &DeadLetterRecord,
    ) -> Result<bool, StorageError> {
        let id = message_id.to_string();
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM outbox_entries WHERE message_id = ?1 AND status = ?2",
                params![id, expected.as_str()],
            )?;
            if removed == 0 {
                return Ok(false);
            }
            insert_dead_letter_row(&tx, &record)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn count_entries(&self) -> Result<usize, StorageError> {
        self.with_conn(|conn| count_entry_rows(conn)).await
    }

    async fn checkpoint(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }
}

// ============================================================================
// LedgerStorage
// ============================================================================

#[async_trait]
impl LedgerStorage for SqliteStore {
    async fn is_message_processed(&self, message_id: &MessageId) -> Result<bool, StorageError> {
        let message_id = *message_id;
        self.with_conn(move |conn| processed_exists(conn, &message_id)).await
    }

    async fn get_processed(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<ProcessedMessageRecord>, StorageError> {
        let id = message_id.to_string();
        let message_id = *message_id;
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT message_type, sender_id, processed_at, checksum, payload_hash \
                     FROM processed_messages WHERE message_id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()?;
            let Some((message_type, sender_id, processed_at, checksum, payload_hash)) = row else {
                return Ok(None);
            };
            Ok(Some(ProcessedMessageRecord {
                message_id,
                message_type: MessageType::parse(&message_type)
                    .map_err(|e| corrupted("processed_messages", &id, e.to_string()))?,
                sender_id: DeviceId::new(sender_id)
                    .map_err(|e| corrupted("processed_messages", &id, e.to_string()))?,
                processed_at: UnixTimeMs(from_sql(processed_at)),
                checksum,
                payload_hash,
            }))
        })
        .await
    }

    async fn insert_processed(&self, record: &ProcessedMessageRecord) -> Result<bool, StorageError> {
        let record = record.clone();
        self.with_conn(move |conn| insert_processed_row(conn, &record)).await
    }

    async fn delete_processed_before(&self, cutoff: UnixTimeMs) -> Result<usize, StorageError> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM processed_messages WHERE processed_at < ?1",
                params![to_sql(cutoff.0)],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn count_processed(&self) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM processed_messages", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }
}

// ============================================================================
// DeadLetterStorage
// ============================================================================

#[async_trait]
impl DeadLetterStorage for SqliteStore {
    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = ?1"
            ))?;
            let mut rows = stmt.query(params![id.to_string()])?;
            match rows.next()? {
                Some(row) => dead_letter_from_row(row).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_unresolved(&self) -> Result<Vec<DeadLetterRecord>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters \
                 WHERE resolved_at IS NULL ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(dead_letter_from_row(row)?);
            }
            Ok(records)
        })
        .await
    }

    async fn count_unresolved(&self) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM dead_letters WHERE resolved_at IS NULL",
                [],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn resolve_dead_letter(
        &self,
        id: Uuid,
        resolution: &Resolution,
        requeue: Option<&OutboxEntry>,
    ) -> Result<bool, StorageError> {
        let resolution = resolution.clone();
        let requeue = requeue.cloned();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE dead_letters SET \
                     resolved_at = ?1, resolved_by = ?2, resolution_action = ?3, \
                     resolution_notes = ?4, requires_review = 0 \
                 WHERE id = ?5 AND resolved_at IS NULL",
                params![
                    to_sql(resolution.resolved_at.0),
                    resolution.resolved_by,
                    resolution.action.as_str(),
                    resolution.notes,
                    id.to_string(),
                ],
            )?;
            if updated == 0 {
                return Ok(false);
            }
            if let Some(entry) = &requeue {
                insert_entry_row(&tx, entry)?;
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn purge_resolved_before(&self, cutoff: UnixTimeMs) -> Result<usize, StorageError> {
        self.with_conn(move |conn| {
            let purged = conn.execute(
                "DELETE FROM dead_letters WHERE resolved_at IS NOT NULL AND resolved_at < ?1",
                params![to_sql(cutoff.0)],
            )?;
            Ok(purged)
        })
        .await
    }
}

// ============================================================================
// OrderStore
// ============================================================================

#[async_trait]
impl OrderStore for SqliteStore {
    async fn load_order(&self, order_id: &OrderId) -> Result<Option<Order>, StorageError> {
        let order_id = order_id.clone();
        self.with_conn(move |conn| load_order_row(conn, &order_id)).await
    }

    async fn list_orders(&self) -> Result<Vec<Order>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT order_id, body FROM orders ORDER BY order_id")?;
            let mut rows = stmt.query([])?;
            let mut orders = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let body: String = row.get(1)?;
                orders.push(
                    serde_json::from_str(&body).map_err(|e| corrupted("orders", &id, e.to_string()))?,
                );
            }
            Ok(orders)
        })
        .await
    }

    async fn commit_local(
        &self,
        previous: Option<&Order>,
        order: &Order,
        entry: &OutboxEntry,
        max_entries: usize,
    ) -> Result<(), StorageError> {
        let previous = previous.cloned();
        let order = order.clone();
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let current = load_order_row(&tx, &order.order_id)?;
            if current != previous {
                return Err(StorageError::Conflict {
                    table: "orders",
                    key: order.order_id.to_string(),
                });
            }
            insert_bounded_entry_row(&tx, &entry, max_entries)?;
            upsert_order_row(&tx, &order)?;
            tx.commit()?;

            debug!(order_id = %order.order_id, message_id = %entry.message_id, "Committed local edit");
            Ok(())
        })
        .await
    }

    async fn apply_and_record(
        &self,
        mutation: &OrderMutation,
        record: &ProcessedMessageRecord,
        precedence: StatusPrecedence,
    ) -> Result<ApplyOutcome, StorageError> {
        let mutation = mutation.clone();
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if processed_exists(&tx, &record.message_id)? {
                return Ok(ApplyOutcome::Duplicate);
            }

            let local = load_order_row(&tx, mutation.order_id())?;
            let effect = match mutation.apply(local.as_ref(), precedence) {
                Ok(effect) => effect,
                Err(e) => return Ok(ApplyOutcome::Rejected(e)),
            };

            if let ApplyEffect::Upserted(order) = &effect {
                upsert_order_row(&tx, order)?;
            }
            insert_processed_row(&tx, &record)?;
            tx.commit()?;

            debug!(message_id = %record.message_id, "Applied remote mutation");
            Ok(ApplyOutcome::Applied(effect))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderStatus;
    use crate::order::ApplyError;
    use tempfile::TempDir;

    fn processed(message_type: MessageType) -> ProcessedMessageRecord {
        ProcessedMessageRecord::new(
            MessageId::generate(),
            message_type,
            DeviceId::new("till-2").unwrap(),
            "00".repeat(32),
            "{}",
            UnixTimeMs(1_000),
        )
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.db");

        let mut entry = OutboxEntry::new(MessageType::OrderCreated, "{}", 1);
        entry.checksum = crate::checksum::compute("{}");
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.insert_entry(&entry, 10).await.unwrap();
            store.checkpoint().await.unwrap();
        }

        let reopened = SqliteStore::open(&path).await.unwrap();
        let loaded = reopened.get_entry(&entry.message_id).await.unwrap().unwrap();
        assert_eq!(loaded, entry);
    }

    #[tokio::test]
    async fn duplicate_insert_maps_to_duplicate_error() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let entry = OutboxEntry::new(MessageType::OrderCreated, "{}", 1);
        store.insert_entry(&entry, 10).await.unwrap();
        assert!(matches!(
            store.insert_entry(&entry, 10).await,
            Err(StorageError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn compare_and_swap_requires_expected_status() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let entry = OutboxEntry::new(MessageType::OrderCreated, "{}", 1);
        store.insert_entry(&entry, 10).await.unwrap();

        let mut sending = entry.clone();
        sending.status = EntryStatus::Sending;
        assert!(!store
            .compare_and_swap(&entry.message_id, EntryStatus::Failed, &sending)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap(&entry.message_id, EntryStatus::Pending, &sending)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn local_commit_writes_order_and_entry_together() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let order = Order::new(Some("T1".into()));
        let entry = OutboxEntry::new(MessageType::OrderCreated, order.created().to_payload().unwrap(), 1);

        store.commit_local(None, &order, &entry, 10).await.unwrap();
        assert_eq!(store.load_order(&order.order_id).await.unwrap(), Some(order));
        assert!(store.get_entry(&entry.message_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn full_outbox_rolls_back_local_commit() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let order = Order::new(None);
        let created = OutboxEntry::new(MessageType::OrderCreated, "{}", 1);
        store.commit_local(None, &order, &created, 1).await.unwrap();

        let mut voided = order.clone();
        voided.set_status(OrderStatus::Void);
        let entry = OutboxEntry::new(MessageType::StatusChanged, "{}", voided.version);
        assert!(matches!(
            store.commit_local(Some(&order), &voided, &entry, 1).await,
            Err(StorageError::Full(1))
        ));

        let stored = store.load_order(&order.order_id).await.unwrap().unwrap();
        assert_eq!(stored, order);
        assert!(store.get_entry(&entry.message_id).await.unwrap().is_none());
        assert_eq!(store.count_entries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_local_commit_is_a_conflict() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let order = Order::new(None);
        let created = OutboxEntry::new(MessageType::OrderCreated, "{}", 1);
        store.commit_local(None, &order, &created, 10).await.unwrap();

        let mut first = order.clone();
        first.set_status(OrderStatus::Ready);
        let first_entry = OutboxEntry::new(MessageType::StatusChanged, "{}", first.version);
        store.commit_local(Some(&order), &first, &first_entry, 10).await.unwrap();

        // Second edit still based on the original copy.
        let mut second = order.clone();
        second.set_status(OrderStatus::Paid);
        let second_entry = OutboxEntry::new(MessageType::StatusChanged, "{}", second.version);
        assert!(matches!(
            store.commit_local(Some(&order), &second, &second_entry, 10).await,
            Err(StorageError::Conflict { table: "orders", .. })
        ));
        assert!(store.get_entry(&second_entry.message_id).await.unwrap().is_none());
        assert_eq!(store.load_order(&order.order_id).await.unwrap(), Some(first));

        // Creating an order id that already exists conflicts too.
        assert!(matches!(
            store.commit_local(None, &order, &OutboxEntry::new(MessageType::OrderCreated, "{}", 1), 10).await,
            Err(StorageError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn bounded_insert_counts_inside_transaction() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .insert_entry(&OutboxEntry::new(MessageType::OrderCreated, "{}", 1), 1)
            .await
            .unwrap();
        assert!(matches!(
            store.insert_entry(&OutboxEntry::new(MessageType::OrderCreated, "{}", 1), 1).await,
            Err(StorageError::Full(1))
        ));
        assert_eq!(store.count_entries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn apply_and_record_is_atomic_and_idempotent() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let order = Order::new(Some("T3".into()));
        let record = processed(MessageType::OrderCreated);

        let first = store
            .apply_and_record(&order.created(), &record, StatusPrecedence::Supremacy)
            .await
            .unwrap();
        assert_eq!(first, ApplyOutcome::Applied(ApplyEffect::Upserted(order.clone())));
        assert!(store.is_message_processed(&record.message_id).await.unwrap());

        let again = store
            .apply_and_record(&order.created(), &record, StatusPrecedence::Supremacy)
            .await
            .unwrap();
        assert_eq!(again, ApplyOutcome::Duplicate);
        assert_eq!(store.list_orders().await.unwrap(), vec![order]);
    }

    #[tokio::test]
    async fn rejected_mutation_leaves_no_ledger_row() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let mut order = Order::new(None);
        let status = order.set_status(OrderStatus::Ready);
        let record = processed(MessageType::StatusChanged);

        let outcome = store
            .apply_and_record(&status, &record, StatusPrecedence::Supremacy)
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Rejected(ApplyError::MissingOrder(_))));
        assert!(!store.is_message_processed(&record.message_id).await.unwrap());
        assert!(store.load_order(&order.order_id).await.unwrap().is_none());
    }
}
