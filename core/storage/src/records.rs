//! Per-note encrypted record store.
//!
//! Each mutation writes the note row and its sync operation in one
//! transaction. Content is sealed under a fresh subkey of the master key on
//! every write; metadata-only edits leave the stored ciphertext untouched.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::database::{db_err, Database};
use crate::note::{Note, NoteContent, NoteDraft, NotePatch, NoteRecord, NoteUpdate};
use crate::queue::{self, millis_to_datetime, SyncOperation};
use notevault_common::{Error, NoteId, Result};
use notevault_crypto::{codec, envelope, AeadAlgorithm, MasterKey};

const SELECT_NOTES: &str = "SELECT id, content, tags, color, pinned, archived, created_at, updated_at, synced FROM notes";

struct RawNote {
    id: String,
    content: String,
    tags: String,
    color: Option<String>,
    pinned: bool,
    archived: bool,
    created_at: i64,
    updated_at: i64,
    synced: bool,
}

impl RawNote {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            tags: row.get(2)?,
            color: row.get(3)?,
            pinned: row.get(4)?,
            archived: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            synced: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<NoteRecord> {
        Ok(NoteRecord {
            id: NoteId::new(self.id)?,
            content: codec::deserialize(self.content.as_bytes())?,
            tags: serde_json::from_str(&self.tags)?,
            color: self.color,
            pinned: self.pinned,
            archived: self.archived,
            created_at: millis_to_datetime(self.created_at)?,
            updated_at: millis_to_datetime(self.updated_at)?,
            synced: self.synced,
        })
    }

    /// Decrypt for listing. Rows that cannot be decoded at all are still
    /// reported, as undecryptable notes.
    fn into_note(self, key: &MasterKey) -> Result<Note> {
        let id = NoteId::new(self.id.clone())?;
        let fallback = Note {
            id: id.clone(),
            content: NoteContent::Undecryptable,
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            color: self.color.clone(),
            pinned: self.pinned,
            archived: self.archived,
            created_at: millis_to_datetime(self.created_at)?,
            updated_at: millis_to_datetime(self.updated_at)?,
            synced: self.synced,
        };

        match self.into_record() {
            Ok(record) => Ok(record.decrypt(key)),
            Err(e) => {
                warn!(note_id = %id, error = %e, "Stored note record is malformed");
                Ok(fallback)
            }
        }
    }
}

fn encode_content(payload: &notevault_crypto::EncryptedPayload) -> Result<String> {
    let bytes = codec::serialize(payload)?;
    String::from_utf8(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

fn load_record(conn: &Connection, id: &NoteId) -> Result<Option<NoteRecord>> {
    let raw = conn
        .query_row(
            &format!("{} WHERE id = ?1", SELECT_NOTES),
            [id.as_str()],
            RawNote::from_row,
        )
        .optional()
        .map_err(db_err)?;
    raw.map(RawNote::into_record).transpose()
}

fn write_record(conn: &Connection, record: &NoteRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO notes
         (id, content, tags, color, pinned, archived, created_at, updated_at, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id.as_str(),
            encode_content(&record.content)?,
            serde_json::to_string(&record.tags)?,
            record.color,
            record.pinned,
            record.archived,
            record.created_at.timestamp_millis(),
            record.updated_at.timestamp_millis(),
            record.synced,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Encrypt and insert a note, queueing its CREATE operation.
pub fn insert(
    conn: &Connection,
    key: &MasterKey,
    algorithm: AeadAlgorithm,
    draft: NoteDraft,
) -> Result<Note> {
    let content = envelope::seal_with_key(key, draft.content.as_bytes(), algorithm)?;
    let record = NoteRecord {
        id: draft.id,
        content,
        tags: draft.tags,
        color: draft.color,
        pinned: draft.pinned,
        archived: draft.archived,
        created_at: draft.created_at,
        updated_at: draft.updated_at,
        synced: false,
    };

    write_record(conn, &record)?;
    queue::append(
        conn,
        SyncOperation::create(record.id.clone(), NotePatch::full(&record)),
    )?;

    debug!(note_id = %record.id, "Created note");
    Ok(Note {
        id: record.id,
        content: NoteContent::Text(draft.content),
        tags: record.tags,
        color: record.color,
        pinned: record.pinned,
        archived: record.archived,
        created_at: record.created_at,
        updated_at: record.updated_at,
        synced: false,
    })
}

/// Delete every note, queueing a DELETE for each. Returns the number removed.
pub fn delete_all(conn: &Connection) -> Result<usize> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM notes").map_err(db_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
        rows.collect::<rusqlite::Result<_>>().map_err(db_err)?
    };

    for id in &ids {
        queue::append(conn, SyncOperation::delete(NoteId::new(id.as_str())?))?;
    }
    conn.execute("DELETE FROM notes", []).map_err(db_err)?;
    Ok(ids.len())
}

/// Encrypted note storage.
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Database>,
    algorithm: AeadAlgorithm,
}

impl RecordStore {
    pub fn new(db: Arc<Database>, algorithm: AeadAlgorithm) -> Self {
        Self { db, algorithm }
    }

    /// Create a note with a fresh id.
    pub fn create(
        &self,
        key: &MasterKey,
        content: &str,
        tags: BTreeSet<String>,
        color: Option<String>,
    ) -> Result<Note> {
        let draft = NoteDraft::new(content, tags, color);
        self.db
            .transaction(|tx| insert(tx, key, self.algorithm, draft))
    }

    /// Apply a partial update.
    ///
    /// Content is re-encrypted only when it is part of the update. The queued
    /// UPDATE carries only the fields that changed; an update that changes
    /// nothing queues nothing.
    ///
    /// # Errors
    /// - `NotFound` if no note has this id
    pub fn update(&self, key: &MasterKey, id: &NoteId, update: NoteUpdate) -> Result<Note> {
        self.db.transaction(|tx| {
            let mut record =
                load_record(tx, id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;

            let mut patch = NotePatch::default();
            let mut plaintext = None;

            if let Some(content) = update.content {
                let current = envelope::open_with_key(key, &record.content)
                    .ok()
                    .map(|p| p.as_bytes() == content.as_bytes());
                if current != Some(true) {
                    record.content =
                        envelope::seal_with_key(key, content.as_bytes(), self.algorithm)?;
                    patch.content = Some(record.content.clone());
                }
                plaintext = Some(content);
            }
            if let Some(tags) = update.tags {
                if tags != record.tags {
                    record.tags = tags.clone();
                    patch.tags = Some(tags);
                }
            }
            if let Some(color) = update.color {
                if color != record.color {
                    record.color = color.clone();
                    patch.color = Some(color);
                }
            }
            if let Some(pinned) = update.pinned {
                if pinned != record.pinned {
                    record.pinned = pinned;
                    patch.pinned = Some(pinned);
                }
            }
            if let Some(archived) = update.archived {
                if archived != record.archived {
                    record.archived = archived;
                    patch.archived = Some(archived);
                }
            }

            if patch == NotePatch::default() {
                debug!(note_id = %id, "Update changed nothing");
            } else {
                record.updated_at = Utc::now().max(record.updated_at);
                record.synced = false;
                patch.updated_at = Some(record.updated_at);

                write_record(tx, &record)?;
                queue::append(tx, SyncOperation::update(id.clone(), patch))?;
                debug!(note_id = %id, "Updated note");
            }

            let mut note = record.decrypt(key);
            if let Some(text) = plaintext {
                note.content = NoteContent::Text(text);
            }
            Ok(note)
        })
    }

    /// Delete a note. Deleting a missing note is a no-op.
    ///
    /// The DELETE operation is queued before the row is removed, in the same
    /// transaction. Returns whether a note was removed.
    pub fn delete(&self, id: &NoteId) -> Result<bool> {
        self.db.transaction(|tx| {
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM notes WHERE id = ?1)",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            if !exists {
                return Ok(false);
            }

            queue::append(tx, SyncOperation::delete(id.clone()))?;
            tx.execute("DELETE FROM notes WHERE id = ?1", [id.as_str()])
                .map_err(db_err)?;
            debug!(note_id = %id, "Deleted note");
            Ok(true)
        })
    }

    /// Delete every note in one transaction.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.db.transaction(|tx| delete_all(tx))?;
        info!(removed, "Cleared note records");
        Ok(removed)
    }

    /// Decrypt all notes lazily. Rows are read up front; decryption happens
    /// as the iterator advances.
    pub fn list<'k>(&self, key: &'k MasterKey) -> Result<impl Iterator<Item = Note> + 'k> {
        let raw = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("{} ORDER BY created_at, id", SELECT_NOTES))
                .map_err(db_err)?;
            let rows = stmt.query_map([], RawNote::from_row).map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })?;

        Ok(raw.into_iter().filter_map(move |row| match row.into_note(key) {
            Ok(note) => Some(note),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable note row");
                None
            }
        }))
    }

    /// Get and decrypt a single note.
    pub fn get(&self, key: &MasterKey, id: &NoteId) -> Result<Option<Note>> {
        Ok(self.record(id)?.map(|record| record.decrypt(key)))
    }

    /// Raw encrypted record.
    pub fn record(&self, id: &NoteId) -> Result<Option<NoteRecord>> {
        self.db.with_conn(|conn| load_record(conn, id))
    }

    /// Number of stored notes.
    pub fn count(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))
                .map_err(db_err)?;
            Ok(count as usize)
        })
    }
}
