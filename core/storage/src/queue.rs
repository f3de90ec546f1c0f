//! Durable queue of pending note mutations.
//!
//! Operations are replayed in `(timestamp, seq)` order. Timestamps are made
//! monotonic on append, so an operation never sorts ahead of one appended
//! before it even if the wall clock steps backwards.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::database::{db_err, Database};
use crate::note::NotePatch;
use notevault_common::{Error, NoteId, OperationId, Result};

/// Kind of queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(OperationType::Create),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            other => Err(Error::Storage(format!("unknown operation type {:?}", other))),
        }
    }
}

/// A pending mutation awaiting remote acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub note_id: NoteId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<NotePatch>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl SyncOperation {
    fn new(op_type: OperationType, note_id: NoteId, payload: Option<NotePatch>) -> Self {
        Self {
            id: OperationId::generate(),
            op_type,
            note_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn create(note_id: NoteId, payload: NotePatch) -> Self {
        Self::new(OperationType::Create, note_id, Some(payload))
    }

    pub fn update(note_id: NoteId, payload: NotePatch) -> Self {
        Self::new(OperationType::Update, note_id, Some(payload))
    }

    pub fn delete(note_id: NoteId) -> Self {
        Self::new(OperationType::Delete, note_id, None)
    }
}

struct RawOperation {
    id: String,
    op_type: String,
    note_id: String,
    payload: Option<String>,
    timestamp: i64,
}

impl RawOperation {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            op_type: row.get(1)?,
            note_id: row.get(2)?,
            payload: row.get(3)?,
            timestamp: row.get(4)?,
        })
    }

    fn into_operation(self) -> Result<SyncOperation> {
        let payload = match self.payload {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(SyncOperation {
            id: OperationId::from_string(self.id),
            op_type: self.op_type.parse()?,
            note_id: NoteId::new(self.note_id)?,
            payload,
            timestamp: millis_to_datetime(self.timestamp)?,
        })
    }
}

pub(crate) fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Storage(format!("timestamp {} out of range", ms)))
}

const SELECT_OPERATIONS: &str =
    "SELECT id, op_type, note_id, payload, timestamp FROM sync_queue";

/// Append `op` on an open connection or transaction.
///
/// Returns the operation as stored; its timestamp is raised to the newest
/// queued timestamp if the clock went backwards.
pub fn append(conn: &Connection, mut op: SyncOperation) -> Result<SyncOperation> {
    let last: Option<i64> = conn
        .query_row("SELECT MAX(timestamp) FROM sync_queue", [], |row| row.get(0))
        .map_err(db_err)?;

    let mut ts = op.timestamp.timestamp_millis();
    if let Some(last) = last {
        ts = ts.max(last);
    }
    op.timestamp = millis_to_datetime(ts)?;

    let payload = op
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO sync_queue (id, op_type, note_id, payload, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            op.id.as_str(),
            op.op_type.as_str(),
            op.note_id.as_str(),
            payload,
            ts
        ],
    )
    .map_err(db_err)?;

    debug!(op_id = %op.id, op_type = %op.op_type, note_id = %op.note_id, "Queued operation");
    Ok(op)
}

fn query_operations(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<SyncOperation>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params, RawOperation::from_row)
        .map_err(db_err)?;

    // A row that cannot be decoded holds back the later operations of its
    // note; other notes keep syncing.
    let mut ops = Vec::new();
    let mut blocked: HashSet<String> = HashSet::new();
    for row in rows {
        let raw = row.map_err(db_err)?;
        if blocked.contains(&raw.note_id) {
            debug!(op_id = %raw.id, note_id = %raw.note_id, "Held back behind unreadable operation");
            continue;
        }

        let (op_id, note_id) = (raw.id.clone(), raw.note_id.clone());
        match raw.into_operation() {
            Ok(op) => ops.push(op),
            Err(e) => {
                warn!(op_id = %op_id, note_id = %note_id, error = %e, "Skipping unreadable queued operation");
                blocked.insert(note_id);
            }
        }
    }
    Ok(ops)
}

/// Persistent sync queue.
#[derive(Clone)]
pub struct SyncQueue {
    db: Arc<Database>,
}

impl SyncQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Durably append an operation.
    pub fn enqueue(&self, op: SyncOperation) -> Result<SyncOperation> {
        self.db.with_conn(|conn| append(conn, op))
    }

    /// All unacknowledged operations in replay order. Does not remove them.
    ///
    /// Rows that fail to decode are logged and left out, together with the
    /// operations queued after them for the same note.
    pub fn drain(&self) -> Result<Vec<SyncOperation>> {
        self.db.with_conn(|conn| {
            query_operations(
                conn,
                &format!("{} ORDER BY timestamp, seq", SELECT_OPERATIONS),
                [],
            )
        })
    }

    /// Pending operations for one note, in replay order.
    pub fn pending_for(&self, note_id: &NoteId) -> Result<Vec<SyncOperation>> {
        self.db.with_conn(|conn| {
            query_operations(
                conn,
                &format!(
                    "{} WHERE note_id = ?1 ORDER BY timestamp, seq",
                    SELECT_OPERATIONS
                ),
                [note_id.as_str()],
            )
        })
    }

    /// Remove an operation confirmed by the remote.
    ///
    /// Unknown or already acknowledged ids are ignored. Returns whether an
    /// operation was removed. When the note has no operations left it is
    /// marked as synced.
    pub fn acknowledge(&self, op_id: &OperationId) -> Result<bool> {
        self.db.transaction(|tx| {
            let note_id: Option<String> = tx
                .query_row(
                    "SELECT note_id FROM sync_queue WHERE id = ?1",
                    [op_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            let Some(note_id) = note_id else {
                return Ok(false);
            };

            tx.execute("DELETE FROM sync_queue WHERE id = ?1", [op_id.as_str()])
                .map_err(db_err)?;

            let remaining: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM sync_queue WHERE note_id = ?1",
                    [&note_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            if remaining == 0 {
                tx.execute("UPDATE notes SET synced = 1 WHERE id = ?1", [&note_id])
                    .map_err(db_err)?;
            }

            debug!(op_id = %op_id, note_id = %note_id, remaining, "Acknowledged operation");
            Ok(true)
        })
    }

    /// Number of pending operations.
    pub fn len(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
                .map_err(db_err)?;
            Ok(count as usize)
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn queue() -> SyncQueue {
        SyncQueue::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_drain_preserves_order_after_unrelated_ack() {
        let queue = queue();
        let note = NoteId::generate();
        let other = NoteId::generate();

        let create = queue
            .enqueue(SyncOperation::create(note.clone(), NotePatch::default()))
            .unwrap();
        let unrelated = queue.enqueue(SyncOperation::delete(other)).unwrap();
        let update = queue
            .enqueue(SyncOperation::update(note.clone(), NotePatch::default()))
            .unwrap();
        let delete = queue.enqueue(SyncOperation::delete(note.clone())).unwrap();

        assert!(queue.acknowledge(&unrelated.id).unwrap());

        let ids: Vec<_> = queue.drain().unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![create.id, update.id, delete.id]);

        let types: Vec<_> = queue
            .pending_for(&note)
            .unwrap()
            .into_iter()
            .map(|op| op.op_type)
            .collect();
        assert_eq!(
            types,
            vec![OperationType::Create, OperationType::Update, OperationType::Delete]
        );
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let queue = queue();
        let note = NoteId::generate();

        let first = queue.enqueue(SyncOperation::delete(note.clone())).unwrap();

        let mut earlier = SyncOperation::delete(note);
        earlier.timestamp = first.timestamp - Duration::seconds(60);
        let second = queue.enqueue(earlier).unwrap();

        assert!(second.timestamp >= first.timestamp);
        let drained = queue.drain().unwrap();
        assert_eq!(drained[0].id, first.id);
        assert_eq!(drained[1].id, second.id);
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let queue = queue();
        let op = queue
            .enqueue(SyncOperation::delete(NoteId::generate()))
            .unwrap();

        assert!(queue.acknowledge(&op.id).unwrap());
        assert!(!queue.acknowledge(&op.id).unwrap());
        assert!(!queue
            .acknowledge(&OperationId::from_string("unknown"))
            .unwrap());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_payload_roundtrips_through_storage() {
        let queue = queue();
        let patch = NotePatch {
            pinned: Some(true),
            ..NotePatch::default()
        };
        queue
            .enqueue(SyncOperation::update(NoteId::generate(), patch.clone()))
            .unwrap();

        let drained = queue.drain().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, Some(patch));
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_color_clear_survives_queue() {
        let queue = queue();
        let patch = NotePatch {
            color: Some(None),
            ..NotePatch::default()
        };
        queue
            .enqueue(SyncOperation::update(NoteId::generate(), patch.clone()))
            .unwrap();

        let drained = queue.drain().unwrap();
        assert_eq!(drained[0].payload, Some(patch));
    }

    #[test]
    fn test_unreadable_row_does_not_block_other_notes() {
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = SyncQueue::new(db.clone());
        let broken_note = NoteId::generate();
        let pinned = NotePatch {
            pinned: Some(true),
            ..NotePatch::default()
        };

        let broken = queue
            .enqueue(SyncOperation::update(broken_note.clone(), pinned.clone()))
            .unwrap();
        let held_back = queue.enqueue(SyncOperation::delete(broken_note.clone())).unwrap();
        let healthy = queue
            .enqueue(SyncOperation::update(NoteId::generate(), pinned))
            .unwrap();

        db.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_queue SET payload = '{not json' WHERE id = ?1",
                [broken.id.as_str()],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .unwrap();

        let ids: Vec<_> = queue.drain().unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![healthy.id.clone()]);
        assert!(queue.pending_for(&broken_note).unwrap().is_empty());
        assert_eq!(queue.len().unwrap(), 3);

        assert!(queue.acknowledge(&broken.id).unwrap());
        let ids: Vec<_> = queue.drain().unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![held_back.id, healthy.id]);
    }

    #[test]
    fn test_operation_json_shape() {
        let op = SyncOperation::delete(NoteId::new("n1").unwrap());
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "DELETE");
        assert_eq!(value["noteId"], "n1");
        assert!(value.get("payload").is_none());
        assert!(value["timestamp"].is_i64());
    }
}
